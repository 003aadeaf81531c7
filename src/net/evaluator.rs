use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use itertools::Itertools;
use thiserror::Error;

use crate::game::common::{GamePosition, IGame};
use crate::game::mcts::Evaluation;
use crate::net::cache::{CacheInfo, InferenceCache};
use crate::net::device_manager::DeviceManager;
use crate::net::model::{InferenceInputs, InferenceOutputs};
use crate::util::metrics::RunningAverage;
use crate::util::queue::BoundedQueue;
use crate::util::stats::{BasicStats, HistogramNumbered};
use crate::util::StopToken;

/// How long a runner keeps collecting after the first item of a batch
/// arrived. Bounds the latency a lone request pays for batching.
const COLLECT_DEADLINE: Duration = Duration::from_millis(1);

const LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvalError {
    /// The evaluator is being torn down; the request was not (or will not
    /// be) served. Actors are expected to watch the stop token and treat
    /// this as a signal to unwind.
    #[error("evaluator is shutting down")]
    Shutdown,
}

#[derive(Clone, Copy, Debug, serde::Deserialize)]
#[serde(default)]
pub struct EvaluatorOptions {
    /// Target batch size. `<= 1` switches to inline mode: no runner
    /// threads, every call runs the model directly.
    pub batch_size: usize,
    /// Runner thread count. Forced to 0 in inline mode.
    pub threads: usize,
    /// Total cache capacity over all shards. 0 disables the cache.
    pub cache_size: usize,
    /// Cache shard count, clamped to >= 1.
    pub cache_shards: usize,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            threads: 1,
            cache_size: 1 << 18,
            cache_shards: 1,
        }
    }
}

struct QueueItem<Game: IGame> {
    inputs: InferenceInputs<Game>,
    /// One-shot completion handle. The runner side sends exactly once; a
    /// dropped unfulfilled sender wakes the waiting actor with a
    /// disconnect, which surfaces as `EvalError::Shutdown`.
    promise: SyncSender<InferenceOutputs<Game>>,
}

struct BatchStats {
    batch_size_stats: BasicStats,
    batch_size_hist: HistogramNumbered,
}

/// The batched inference dispatcher.
///
/// A shared handle callable from any number of actor threads. Requests hit
/// the sharded cache first; misses are either executed inline
/// (`batch_size <= 1`) or coalesced by the runner threads into fixed-size
/// padded batches and dispatched to a model replica. Back-pressure comes
/// from the bounded queue: when the model falls behind, pushers block.
pub struct NetEvaluator<Game: IGame> {
    device_manager: Arc<DeviceManager<Game>>,
    batch_size: usize,
    cache: Option<Arc<InferenceCache<Game>>>,
    queue: Arc<BoundedQueue<QueueItem<Game>>>,
    stats: Arc<Mutex<BatchStats>>,
    stop: Arc<StopToken>,
    runners: Vec<JoinHandle<()>>,
}

impl<Game: IGame> NetEvaluator<Game> {
    pub fn new(device_manager: Arc<DeviceManager<Game>>, options: EvaluatorOptions) -> Self {
        let batch_size = options.batch_size.max(1);
        let threads = if options.batch_size <= 1 { 0 } else { options.threads };
        let cache = (options.cache_size > 0).then(|| {
            Arc::new(InferenceCache::new(
                options.cache_size,
                options.cache_shards.max(1),
            ))
        });

        let queue = Arc::new(BoundedQueue::new((batch_size * threads * 4).max(1)));
        let stats = Arc::new(Mutex::new(BatchStats {
            batch_size_stats: BasicStats::new(),
            batch_size_hist: HistogramNumbered::new(batch_size + 1),
        }));
        let stop = Arc::new(StopToken::new());

        let listener = Arc::new(Mutex::new(()));
        let runners = (0..threads)
            .map(|i| {
                let runner = Runner {
                    device_manager: device_manager.clone(),
                    queue: queue.clone(),
                    listener: listener.clone(),
                    stats: stats.clone(),
                    stop: stop.clone(),
                    batch_size,
                };
                thread::Builder::new()
                    .name(format!("inference-runner-{i}"))
                    .spawn(move || runner.run())
                    .unwrap()
            })
            .collect_vec();

        Self {
            device_manager,
            batch_size,
            cache,
            queue,
            stats,
            stop,
            runners,
        }
    }

    /// Run (or fetch from the cache) one network evaluation of `position`.
    /// May block on queue back-pressure and on the model itself.
    pub fn inference(&self, position: &Game::Position) -> Result<InferenceOutputs<Game>, EvalError> {
        let inputs = InferenceInputs {
            legal_moves: position.get_legal_moves(),
            observation: position.observation_tensor(),
        };

        let key = self.cache.as_ref().map(|_| inputs.fingerprint());
        if let (Some(cache), Some(key)) = (&self.cache, key) {
            if let Some(outputs) = cache.get(key) {
                return Ok(outputs);
            }
        }

        let outputs = if self.batch_size <= 1 {
            self.device_manager
                .get(1)
                .inference(std::slice::from_ref(&inputs))
                .into_iter()
                .next()
                .unwrap()
        } else {
            let (promise, result) = mpsc::sync_channel(1);
            if !self.queue.push(QueueItem { inputs, promise }) {
                return Err(EvalError::Shutdown);
            }
            result.recv().map_err(|_disconnected| EvalError::Shutdown)?
        };

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.set(key, outputs.clone());
        }
        Ok(outputs)
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.cache.as_ref().map(|cache| cache.info()).unwrap_or_default()
    }

    pub fn reset_batch_size_stats(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.batch_size_stats.reset();
        stats.batch_size_hist.reset();
    }

    pub fn batch_size_stats(&self) -> BasicStats {
        self.stats.lock().unwrap().batch_size_stats.clone()
    }

    pub fn batch_size_histogram(&self) -> HistogramNumbered {
        self.stats.lock().unwrap().batch_size_hist.clone()
    }
}

impl<Game: IGame> Evaluation<Game> for NetEvaluator<Game> {
    fn prior(&self, position: &Game::Position) -> Result<Vec<(Game::Move, f32)>, EvalError> {
        if position.is_chance_node() {
            /* The game's intrinsic distribution; the model is never asked */
            return Ok(position.chance_outcomes());
        }
        Ok(self.inference(position)?.policy)
    }

    fn evaluate(&self, position: &Game::Position) -> Result<[f32; 2], EvalError> {
        /* Two-player zero-sum: one value head scalar serves both players */
        let value = self.inference(position)?.value;
        Ok([value, -value])
    }
}

impl<Game: IGame> Drop for NetEvaluator<Game> {
    fn drop(&mut self) {
        self.stop.stop();
        self.queue.block_new_values();
        /* Pending senders are dropped here, waking their waiters */
        self.queue.clear();
        for runner in self.runners.drain(..) {
            runner.join().unwrap();
        }
    }
}

struct Runner<Game: IGame> {
    device_manager: Arc<DeviceManager<Game>>,
    queue: Arc<BoundedQueue<QueueItem<Game>>>,
    listener: Arc<Mutex<()>>,
    stats: Arc<Mutex<BatchStats>>,
    stop: Arc<StopToken>,
    batch_size: usize,
}

struct RunnerMetrics {
    activation_count: metrics::Counter,
    run_duration: RunningAverage,
    batch_size: RunningAverage,
}

impl<Game: IGame> Runner<Game> {
    fn run(self) {
        let mut run_metrics = RunnerMetrics {
            activation_count: metrics::counter!("model.activation_count"),
            run_duration: RunningAverage::new(0.99, metrics::gauge!("model.run_duration")),
            batch_size: RunningAverage::new(0.99, metrics::gauge!("model.batch_size")),
        };

        let mut inputs: Vec<InferenceInputs<Game>> = Vec::with_capacity(self.batch_size);
        let mut promises: Vec<SyncSender<InferenceOutputs<Game>>> =
            Vec::with_capacity(self.batch_size);

        let mut last_log_time = Instant::now();
        let mut items_since_log = 0usize;
        let mut batches_since_log = 0usize;
        let mut inference_time_since_log = Duration::ZERO;

        while !self.stop.stop_requested() {
            {
                /* Only one runner listens at a time. A single assembler fills
                 * batches toward the target size; competing assemblers would
                 * split the stream into fragments of 1-2 items. */
                let _listener = self.listener.lock().unwrap();
                let mut deadline = None;
                while inputs.len() < self.batch_size {
                    let Some(item) = self.queue.pop(deadline) else {
                        break;
                    };
                    if inputs.is_empty() {
                        deadline = Some(Instant::now() + COLLECT_DEADLINE);
                    }
                    inputs.push(item.inputs);
                    promises.push(item.promise);
                }
            }

            if inputs.is_empty() {
                /* Terminal drain or spurious wake-up; re-check the stop flag */
                continue;
            }

            let real_batch_size = inputs.len();
            /* The model sees exactly batch_size rows on every call so that
             * accelerator kernels are tuned for a single shape. Rows past
             * real_batch_size duplicate slot 0 and their outputs are
             * discarded. */
            let padding = inputs[0].clone();
            inputs.resize(self.batch_size, padding);

            {
                let mut stats = self.stats.lock().unwrap();
                stats.batch_size_stats.add(real_batch_size as f64);
                stats.batch_size_hist.add(real_batch_size);
            }

            let model_start = Instant::now();
            let outputs = self.device_manager.get(self.batch_size).inference(&inputs);
            let latency = model_start.elapsed();

            run_metrics.activation_count.increment(1);
            run_metrics.run_duration.set(latency.as_secs_f64());
            run_metrics.batch_size.set(real_batch_size as f64);

            items_since_log += real_batch_size;
            batches_since_log += 1;
            inference_time_since_log += latency;
            if last_log_time.elapsed() >= LOG_INTERVAL {
                let interval = last_log_time.elapsed().as_secs_f64();
                log::info!(
                    "inference: {:.0} items/s, avg batch {:.1}, avg latency {:.2} ms",
                    items_since_log as f64 / interval,
                    items_since_log as f64 / batches_since_log as f64,
                    inference_time_since_log.as_secs_f64() * 1000.0 / batches_since_log as f64,
                );
                last_log_time = Instant::now();
                items_since_log = 0;
                batches_since_log = 0;
                inference_time_since_log = Duration::ZERO;
            }

            /* Fulfill the real requests only. A receiver that disappeared
             * mid-shutdown is not an error. */
            for (promise, output) in promises.drain(..).zip(outputs) {
                let _ = promise.send(output);
            }
            inputs.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Condvar;

    use crate::game::common::{GameColor, GameMove, GamePlayer};
    use crate::game::connectk::{ConnectKGame, ConnectKMove, ConnectKPosition};
    use crate::net::model::{InferenceModel, UniformModel};

    type Game = ConnectKGame<3, 3, 3>;
    type Position = ConnectKPosition<3, 3, 3>;
    type Move = ConnectKMove<3, 3, 3>;

    /// Records every batch it is called with, optionally sleeping to keep
    /// the device busy while tests line up the next batch.
    struct RecordingModel {
        batches: Arc<Mutex<Vec<Vec<InferenceInputs<Game>>>>>,
        delay: Duration,
    }

    impl InferenceModel<Game> for RecordingModel {
        fn inference(&mut self, batch: &[InferenceInputs<Game>]) -> Vec<InferenceOutputs<Game>> {
            self.batches.lock().unwrap().push(batch.to_vec());
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            InferenceModel::<Game>::inference(&mut UniformModel, batch)
        }
    }

    fn evaluator_with_recording(
        options: EvaluatorOptions,
        delay: Duration,
    ) -> (NetEvaluator<Game>, Arc<Mutex<Vec<Vec<InferenceInputs<Game>>>>>) {
        let batches = Arc::new(Mutex::new(vec![]));
        let mut device_manager = DeviceManager::new();
        device_manager.add_device(Box::new(RecordingModel {
            batches: batches.clone(),
            delay,
        }));
        let evaluator = NetEvaluator::new(Arc::new(device_manager), options);
        (evaluator, batches)
    }

    fn position_after(first_move: usize) -> Position {
        Position::new().make_move_new(Move::from_idx(first_move))
    }

    #[test]
    fn inline_single_call() {
        let options = EvaluatorOptions {
            batch_size: 1,
            threads: 0,
            cache_size: 0,
            cache_shards: 1,
        };
        let (evaluator, batches) = evaluator_with_recording(options, Duration::ZERO);

        let pos = Position::new();
        let outputs = evaluator.inference(&pos).unwrap();
        assert_eq!(outputs.policy.len(), 9);

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].legal_moves.len(), 9);
    }

    #[test]
    fn inline_mode_forced_when_batch_size_is_one() {
        let options = EvaluatorOptions {
            batch_size: 1,
            threads: 8,
            cache_size: 0,
            cache_shards: 1,
        };
        let (evaluator, _batches) = evaluator_with_recording(options, Duration::ZERO);
        assert!(evaluator.runners.is_empty());
        assert!(evaluator.queue.is_empty());
        evaluator.inference(&Position::new()).unwrap();
        assert!(evaluator.queue.is_empty());
    }

    #[test]
    fn cached_repeat_hits_model_once() {
        let options = EvaluatorOptions {
            batch_size: 1,
            threads: 0,
            cache_size: 1024,
            cache_shards: 4,
        };
        let (evaluator, batches) = evaluator_with_recording(options, Duration::ZERO);

        let pos = Position::new();
        let first = evaluator.inference(&pos).unwrap();
        let second = evaluator.inference(&pos).unwrap();

        assert_eq!(batches.lock().unwrap().len(), 1);
        assert_eq!(first.value.to_bits(), second.value.to_bits());
        assert_eq!(first.policy.len(), second.policy.len());
        for ((m1, p1), (m2, p2)) in first.policy.iter().zip(&second.policy) {
            assert_eq!(m1, m2);
            assert_eq!(p1.to_bits(), p2.to_bits());
        }

        let info = evaluator.cache_info();
        assert_eq!(info.hits, 1);
        assert_eq!(info.misses, 1);
        assert_eq!(info.size, 1);
    }

    #[test]
    fn clear_cache_forgets_entries() {
        let options = EvaluatorOptions {
            batch_size: 1,
            threads: 0,
            cache_size: 1024,
            cache_shards: 2,
        };
        let (evaluator, batches) = evaluator_with_recording(options, Duration::ZERO);

        let pos = Position::new();
        evaluator.inference(&pos).unwrap();
        evaluator.clear_cache();
        assert_eq!(evaluator.cache_info().size, 0);
        evaluator.inference(&pos).unwrap();
        assert_eq!(batches.lock().unwrap().len(), 2);
    }

    #[test]
    fn batched_coalescing() {
        let options = EvaluatorOptions {
            batch_size: 8,
            threads: 1,
            cache_size: 0,
            cache_shards: 1,
        };
        let (evaluator, batches) = evaluator_with_recording(options, Duration::from_millis(200));
        let evaluator = Arc::new(evaluator);

        /* Warm-up request keeps the device busy while the real requests
         * pile up in the queue */
        let warmup = {
            let evaluator = evaluator.clone();
            thread::spawn(move || evaluator.inference(&Position::new()).unwrap())
        };
        thread::sleep(Duration::from_millis(50));

        let actors = (0..8)
            .map(|i| {
                let evaluator = evaluator.clone();
                thread::spawn(move || evaluator.inference(&position_after(i)).unwrap())
            })
            .collect_vec();
        warmup.join().unwrap();
        for actor in actors {
            let outputs = actor.join().unwrap();
            assert_eq!(outputs.policy.len(), 8);
        }

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        /* Every call is padded to the full batch size */
        assert_eq!(batches[0].len(), 8);
        assert_eq!(batches[1].len(), 8);
        /* The second batch carries the 8 distinct requests, no padding */
        let distinct = batches[1].iter().map(|i| i.fingerprint()).unique().count();
        assert_eq!(distinct, 8);

        let stats = evaluator.batch_size_stats();
        assert_eq!(stats.num(), 2);
        assert_eq!(stats.min(), 1.0);
        assert_eq!(stats.max(), 8.0);
        let hist = evaluator.batch_size_histogram();
        assert_eq!(hist.count(1), 1);
        assert_eq!(hist.count(8), 1);
    }

    #[test]
    fn partial_batch_is_padded_with_first_input() {
        let options = EvaluatorOptions {
            batch_size: 8,
            threads: 1,
            cache_size: 0,
            cache_shards: 1,
        };
        let (evaluator, batches) = evaluator_with_recording(options, Duration::from_millis(200));
        let evaluator = Arc::new(evaluator);

        let warmup = {
            let evaluator = evaluator.clone();
            thread::spawn(move || evaluator.inference(&Position::new()).unwrap())
        };
        thread::sleep(Duration::from_millis(50));

        let actors = (0..3)
            .map(|i| {
                let evaluator = evaluator.clone();
                thread::spawn(move || evaluator.inference(&position_after(i)).unwrap())
            })
            .collect_vec();
        warmup.join().unwrap();
        let results = actors.into_iter().map(|a| a.join().unwrap()).collect_vec();
        assert_eq!(results.len(), 3);

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        let batch = &batches[1];
        assert_eq!(batch.len(), 8);
        /* 3 genuine rows, the rest duplicate row 0 */
        assert_eq!(batch.iter().map(|i| i.fingerprint()).unique().count(), 3);
        for padded in &batch[3..] {
            assert_eq!(padded, &batch[0]);
        }

        assert_eq!(evaluator.batch_size_histogram().count(3), 1);
    }

    #[test]
    fn reset_batch_size_stats() {
        let options = EvaluatorOptions {
            batch_size: 4,
            threads: 1,
            cache_size: 0,
            cache_shards: 1,
        };
        let (evaluator, _batches) = evaluator_with_recording(options, Duration::ZERO);
        let evaluator = Arc::new(evaluator);

        evaluator.inference(&Position::new()).unwrap();
        assert!(evaluator.batch_size_stats().num() >= 1);

        evaluator.reset_batch_size_stats();
        assert_eq!(evaluator.batch_size_stats().num(), 0);
        assert_eq!(evaluator.batch_size_histogram().counts().iter().sum::<u64>(), 0);
    }

    #[test]
    fn evaluate_is_zero_sum() {
        let options = EvaluatorOptions {
            batch_size: 1,
            threads: 0,
            cache_size: 0,
            cache_shards: 1,
        };
        let mut device_manager: DeviceManager<Game> = DeviceManager::new();
        device_manager.add_device(Box::new(crate::net::model::TwoHeadedMlp::new_random(
            Game::OBS_SIZE,
            Game::MOVES_NUM,
            16,
            0x5eed,
        )));
        let evaluator = NetEvaluator::new(Arc::new(device_manager), options);

        let values = evaluator.evaluate(&Position::new()).unwrap();
        assert_eq!(values[0], -values[1]);
    }

    /* A two-move game whose root is resolved by a coin flip. Exercises the
     * chance-node bypass in `prior`. */
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    struct CoinMove(u8);

    impl fmt::Display for CoinMove {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "coin-{}", self.0)
        }
    }

    impl GameMove for CoinMove {
        type Game = CoinGame;

        fn to_nn_idx(&self) -> usize {
            self.0 as usize
        }
    }

    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    struct CoinPosition {
        resolved: bool,
    }

    impl GamePosition for CoinPosition {
        type Game = CoinGame;

        fn new() -> Self {
            Self { resolved: false }
        }
        fn get_turn(&self) -> GameColor {
            GameColor::Player1
        }
        fn get_legal_moves(&self) -> Vec<CoinMove> {
            vec![CoinMove(0), CoinMove(1)]
        }
        fn get_moved_position(&self, _m: CoinMove) -> Self {
            Self { resolved: true }
        }
        fn is_over(&self) -> bool {
            self.resolved
        }
        fn get_winner(&self) -> Option<GameColor> {
            None
        }
        fn observation_tensor(&self) -> Vec<f32> {
            vec![if self.resolved { 1.0 } else { 0.0 }, 1.0]
        }
        fn is_chance_node(&self) -> bool {
            !self.resolved
        }
        fn chance_outcomes(&self) -> Vec<(CoinMove, f32)> {
            if self.resolved {
                vec![]
            } else {
                vec![(CoinMove(0), 0.5), (CoinMove(1), 0.5)]
            }
        }
        fn print(&self) {}
    }

    struct CoinGame {
        pos: CoinPosition,
    }

    impl IGame for CoinGame {
        type Position = CoinPosition;
        type Move = CoinMove;
        const MOVES_NUM: usize = 2;
        const OBS_SIZE: usize = 2;

        fn new() -> Self {
            Self::new_from_pos(CoinPosition::new())
        }
        fn new_from_pos(pos: CoinPosition) -> Self {
            Self { pos }
        }
        fn get_position(&self) -> &CoinPosition {
            &self.pos
        }
        fn is_over(&self) -> bool {
            self.pos.is_over()
        }
        fn get_winner(&self) -> Option<GameColor> {
            None
        }
        fn play_single_turn(&mut self, next_move: CoinMove) {
            self.pos = self.pos.get_moved_position(next_move);
        }
        fn play_until_over(
            &mut self,
            player1: &mut dyn GamePlayer<Self>,
            _player2: &mut dyn GamePlayer<Self>,
        ) -> (CoinPosition, Option<GameColor>) {
            while !self.is_over() {
                let next_move = player1.next_move(&self.pos).unwrap();
                self.play_single_turn(next_move);
            }
            (self.pos, None)
        }
    }

    struct PanicModel;
    impl InferenceModel<CoinGame> for PanicModel {
        fn inference(&mut self, _batch: &[InferenceInputs<CoinGame>]) -> Vec<InferenceOutputs<CoinGame>> {
            panic!("the model must not be invoked for chance nodes");
        }
    }

    #[test]
    fn chance_node_prior_bypasses_model() {
        let options = EvaluatorOptions {
            batch_size: 1,
            threads: 0,
            cache_size: 0,
            cache_shards: 1,
        };
        let mut device_manager: DeviceManager<CoinGame> = DeviceManager::new();
        device_manager.add_device(Box::new(PanicModel));
        let evaluator = NetEvaluator::new(Arc::new(device_manager), options);

        let chance_pos = CoinPosition::new();
        let prior = evaluator.prior(&chance_pos).unwrap();
        assert_eq!(prior, chance_pos.chance_outcomes());
    }

    /// Blocks every inference call until the gate is opened, then passes
    /// through to the uniform model.
    struct GateModel {
        gate: Arc<(Mutex<bool>, Condvar)>,
        calls: Arc<AtomicUsize>,
    }

    impl InferenceModel<Game> for GateModel {
        fn inference(&mut self, batch: &[InferenceInputs<Game>]) -> Vec<InferenceOutputs<Game>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (lock, condvar) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = condvar.wait(open).unwrap();
            }
            drop(open);
            InferenceModel::<Game>::inference(&mut UniformModel, batch)
        }
    }

    fn open_gate(gate: &(Mutex<bool>, Condvar)) {
        let (lock, condvar) = gate;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
    }

    #[test]
    fn shutdown_wakes_pending_waiters() {
        let options = EvaluatorOptions {
            batch_size: 2,
            threads: 1,
            cache_size: 0,
            cache_shards: 1,
        };
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut device_manager = DeviceManager::<Game>::new();
        device_manager.add_device(Box::new(GateModel {
            gate: gate.clone(),
            calls: calls.clone(),
        }));
        let evaluator = NetEvaluator::new(Arc::new(device_manager), options);

        thread::scope(|scope| {
            let evaluator = &evaluator;

            /* One request; the runner takes it and blocks inside the model */
            let served = scope.spawn(move || evaluator.inference(&position_after(0)));
            while calls.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(1));
            }

            /* These stay queued: the only runner is stuck on the device */
            let pending = [2, 3].map(|i| scope.spawn(move || evaluator.inference(&position_after(i))));
            thread::sleep(Duration::from_millis(30));

            /* Tear down while requests are both in flight and queued */
            evaluator.stop.stop();
            evaluator.queue.block_new_values();
            evaluator.queue.clear();

            /* Cleared waiters observe the shutdown instead of deadlocking */
            for actor in pending {
                assert!(matches!(actor.join().unwrap(), Err(EvalError::Shutdown)));
            }

            /* The already-popped item is still served once the device returns */
            open_gate(&gate);
            assert!(served.join().unwrap().is_ok());

            /* New requests after the teardown began fail immediately */
            assert!(matches!(
                evaluator.inference(&position_after(4)),
                Err(EvalError::Shutdown)
            ));
        });

        let drop_start = Instant::now();
        drop(evaluator);
        assert!(drop_start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn drop_with_two_runners_joins_quickly() {
        let options = EvaluatorOptions {
            batch_size: 2,
            threads: 2,
            cache_size: 0,
            cache_shards: 1,
        };
        let (evaluator, _batches) = evaluator_with_recording(options, Duration::ZERO);

        thread::scope(|scope| {
            let evaluator = &evaluator;
            let actors = (0..3).map(|i| scope.spawn(move || evaluator.inference(&position_after(i))));
            for actor in actors.collect_vec() {
                assert!(actor.join().unwrap().is_ok());
            }
        });

        let drop_start = Instant::now();
        drop(evaluator);
        assert!(drop_start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn queue_backpressure_bounds_outstanding_items() {
        let options = EvaluatorOptions {
            batch_size: 2,
            threads: 1,
            cache_size: 0,
            cache_shards: 1,
        };
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut device_manager = DeviceManager::<Game>::new();
        device_manager.add_device(Box::new(GateModel {
            gate: gate.clone(),
            calls: calls.clone(),
        }));
        let evaluator = NetEvaluator::new(Arc::new(device_manager), options);
        assert_eq!(evaluator.queue.capacity(), 2 * 1 * 4);

        thread::scope(|scope| {
            let evaluator = &evaluator;

            /* More actors than queue capacity + one in-flight batch */
            let actors = (0..9)
                .map(|i| scope.spawn(move || evaluator.inference(&position_after(i))))
                .collect_vec();

            while calls.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(30));
            /* The overflow actors block inside push rather than piling up */
            assert!(evaluator.queue.len() <= evaluator.queue.capacity());

            open_gate(&gate);
            for actor in actors {
                assert!(actor.join().unwrap().is_ok());
            }
        });
    }
}
