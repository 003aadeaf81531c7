use itertools::Itertools;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::game::common::{GameColor, IGame};
use crate::game::mcts::MctsPlayer;
use crate::util::queue::BoundedQueue;
use crate::util::{Builder, StopToken};

/// One finished self-play game: every position the actor searched, the
/// normalized visit distribution recorded there, and the final result.
pub struct Trajectory<Game: IGame> {
    pub states: Vec<TrajectoryState<Game>>,
    pub winner: Option<GameColor>,
}

pub struct TrajectoryState<Game: IGame> {
    pub position: Game::Position,
    pub probs: Vec<(Game::Move, f32)>,
}

#[derive(Copy, Clone, Default)]
pub struct GamesResults {
    pub w1: u32,
    pub w2: u32,
    pub d: u32,
}

/// Drives a pool of actor threads. Each actor repeatedly claims a game,
/// plays it against itself with a fresh MCTS player, and pushes the
/// trajectory into the shared queue. All loops watch the stop token.
pub struct SelfPlayRunner<Game: IGame> {
    player_builder: Arc<dyn Builder<MctsPlayer<Game>>>,
    trajectory_queue: Arc<BoundedQueue<Trajectory<Game>>>,
    stop: Arc<StopToken>,
    /// Move number after which the actors switch from sampling to playing
    /// the most visited move.
    temperature_drop: usize,
    thread_num: usize,
}

impl<Game: IGame> SelfPlayRunner<Game> {
    pub fn new(
        player_builder: Arc<dyn Builder<MctsPlayer<Game>>>,
        trajectory_queue: Arc<BoundedQueue<Trajectory<Game>>>,
        stop: Arc<StopToken>,
        temperature_drop: usize,
        thread_num: u32,
    ) -> Self {
        assert!(thread_num > 0);
        Self {
            player_builder,
            trajectory_queue,
            stop,
            temperature_drop,
            thread_num: thread_num as usize,
        }
    }

    pub fn generate_data(&self, games_num: usize) -> GamesResults {
        let games_counter = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(GamesResults::default()));

        let job_builder = || {
            let worker = SelfPlayWorker {
                player_builder: self.player_builder.clone(),
                trajectory_queue: self.trajectory_queue.clone(),
                stop: self.stop.clone(),
                results: results.clone(),
                games_counter: games_counter.clone(),
                temperature_drop: self.temperature_drop,
                games_num,
            };
            move || worker.generate_data()
        };

        /* Spawn thread_num-1 workers, the current thread runs job 0 */
        let threads = (1..self.thread_num)
            .map(|_| thread::spawn(job_builder()))
            .collect_vec();
        job_builder()();
        for t in threads {
            t.join().unwrap();
        }

        let results = *results.lock().unwrap();
        results
    }
}

struct SelfPlayWorker<Game: IGame> {
    player_builder: Arc<dyn Builder<MctsPlayer<Game>>>,
    trajectory_queue: Arc<BoundedQueue<Trajectory<Game>>>,
    stop: Arc<StopToken>,
    results: Arc<Mutex<GamesResults>>,
    games_counter: Arc<AtomicUsize>,
    temperature_drop: usize,
    games_num: usize,
}

impl<Game: IGame> SelfPlayWorker<Game> {
    fn generate_data(&self) {
        while !self.stop.stop_requested() {
            let game_idx = self.games_counter.fetch_add(1, Ordering::SeqCst);
            if game_idx >= self.games_num {
                break;
            }
            if !self.play_game() {
                break;
            }
        }
    }

    /// Play one game to the end. Returns false once the trajectory queue
    /// refuses new games.
    fn play_game(&self) -> bool {
        let mut player = self.player_builder.build();
        let mut game = Game::new();
        let mut states = Vec::new();

        while !game.is_over() {
            if self.stop.stop_requested() {
                /* Abandon the unfinished game, nothing is recorded */
                return true;
            }
            player.set_temperature(if states.len() < self.temperature_drop { 1.0 } else { 0.0 });

            let position = *game.get_position();
            let Ok(probs) = player.calc_moves_probabilities(&position) else {
                /* The evaluator is shutting down */
                return true;
            };
            let Some(next_move) = player.choose_move_from_probabilities(&probs) else {
                break;
            };
            states.push(TrajectoryState { position, probs });
            game.play_single_turn(next_move);
        }
        if !game.is_over() {
            return true;
        }

        let winner = game.get_winner();
        {
            let mut results = self.results.lock().unwrap();
            match winner {
                Some(GameColor::Player1) => results.w1 += 1,
                Some(GameColor::Player2) => results.w2 += 1,
                None => results.d += 1,
            }
        }
        self.trajectory_queue.push(Trajectory { states, winner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::common::GamePosition;
    use crate::game::connectk::ConnectKGame;
    use crate::game::mcts::MctsParams;
    use crate::net::device_manager::DeviceManager;
    use crate::net::evaluator::{EvaluatorOptions, NetEvaluator};
    use crate::net::model::UniformModel;

    type Game = ConnectKGame<3, 3, 3>;

    struct PlayerBuilder {
        params: MctsParams<Game>,
    }
    impl Builder<MctsPlayer<Game>> for PlayerBuilder {
        fn build(&self) -> MctsPlayer<Game> {
            MctsPlayer::new(self.params.clone())
        }
    }

    fn make_runner(
        stop: Arc<StopToken>,
        actors: u32,
    ) -> (SelfPlayRunner<Game>, Arc<BoundedQueue<Trajectory<Game>>>) {
        let mut device_manager = DeviceManager::new();
        device_manager.add_device(Box::new(UniformModel));
        let options = EvaluatorOptions {
            batch_size: 2,
            threads: 1,
            cache_size: 1024,
            cache_shards: 2,
        };
        let evaluator = Arc::new(NetEvaluator::new(Arc::new(device_manager), options));

        let trajectory_queue = Arc::new(BoundedQueue::new(64));
        let runner = SelfPlayRunner::new(
            Arc::new(PlayerBuilder {
                params: MctsParams::new(16, evaluator),
            }),
            trajectory_queue.clone(),
            stop,
            4,
            actors,
        );
        (runner, trajectory_queue)
    }

    #[test]
    fn small_run_produces_trajectories() {
        let stop = Arc::new(StopToken::new());
        let (runner, trajectory_queue) = make_runner(stop, 2);

        let games_num = 4;
        let results = runner.generate_data(games_num);
        assert_eq!((results.w1 + results.w2 + results.d) as usize, games_num);

        assert_eq!(trajectory_queue.len(), games_num);
        while let Some(trajectory) = trajectory_queue.pop(None) {
            assert!(!trajectory.states.is_empty());
            assert!(trajectory.states.len() <= 9);
            for state in &trajectory.states {
                let p_sum: f32 = state.probs.iter().map(|(_m, p)| p).sum();
                assert!((p_sum - 1.0).abs() < 1e-5);
                assert!(!state.position.is_over());
            }
            if trajectory_queue.is_empty() {
                break;
            }
        }
    }

    #[test]
    fn pre_stopped_run_plays_nothing() {
        let stop = Arc::new(StopToken::new());
        stop.stop();
        let (runner, trajectory_queue) = make_runner(stop, 2);

        let results = runner.generate_data(100);
        assert_eq!(results.w1 + results.w2 + results.d, 0);
        assert!(trajectory_queue.is_empty());
    }
}
