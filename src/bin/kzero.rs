use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use kzero::game::common::IGame;
use kzero::game::connectk::ConnectKGame;
use kzero::game::mcts::{Evaluation, MctsParams, MctsPlayer};
use kzero::game::self_play::{SelfPlayRunner, Trajectory};
use kzero::net::device_manager::DeviceManager;
use kzero::net::evaluator::{EvaluatorOptions, NetEvaluator};
use kzero::net::model::TwoHeadedMlp;
use kzero::util::queue::BoundedQueue;
use kzero::util::{Builder, StopToken};

type Game = ConnectKGame<7, 7, 4>;

#[derive(Parser, Debug)]
#[clap(about, long_about = None)]
struct Args {
    #[clap(long, default_value = "100")]
    games_num: usize,
    #[clap(long, default_value = "7")]
    actors: u32,
    #[clap(long, default_value = "300")]
    sim_num: u32,
    #[clap(long, default_value = "32")]
    batch_size: usize,
    #[clap(long, default_value = "2")]
    inference_threads: usize,
    #[clap(long, default_value = "262144")]
    cache_size: usize,
    /// 0 derives the shard count from the actor count
    #[clap(long, default_value = "0")]
    cache_shards: usize,
    #[clap(long, default_value = "1")]
    model_replicas: usize,
    #[clap(long, default_value = "64")]
    hidden_size: usize,
    #[clap(long, default_value = "1.41421")]
    explore_factor: f32,
    #[clap(long, default_value = "1.0")]
    prior_noise_alpha: f32,
    #[clap(long, default_value = "0.25")]
    prior_noise_epsilon: f32,
    #[clap(long, default_value = "10")]
    temperature_drop: usize,
    #[clap(long, default_value = "0")]
    model_seed: u64,
    #[clap(long)]
    summary_file: Option<PathBuf>,
}

struct PlayerBuilder {
    params: MctsParams<Game>,
}

impl Builder<MctsPlayer<Game>> for PlayerBuilder {
    fn build(&self) -> MctsPlayer<Game> {
        MctsPlayer::new(self.params.clone())
    }
}

fn main() -> std::io::Result<()> {
    kzero::util::init_globals();
    let args = Args::parse();

    let stop = Arc::new(StopToken::new());

    /* Every replica is initialized from the same seed, like replicas of one
     * checkpoint on several devices */
    let mut device_manager = DeviceManager::new();
    for _ in 0..args.model_replicas.max(1) {
        device_manager.add_device(Box::new(TwoHeadedMlp::new_random(
            Game::OBS_SIZE,
            Game::MOVES_NUM,
            args.hidden_size,
            args.model_seed,
        )));
    }

    let cache_shards = if args.cache_shards > 0 {
        args.cache_shards
    } else {
        (args.actors as usize / 16).max(1)
    };
    let evaluator = Arc::new(NetEvaluator::new(
        Arc::new(device_manager),
        EvaluatorOptions {
            batch_size: args.batch_size,
            threads: args.inference_threads,
            cache_size: args.cache_size,
            cache_shards,
        },
    ));

    let trajectory_queue = Arc::new(BoundedQueue::<Trajectory<Game>>::new(1024));
    let collector = {
        let trajectory_queue = trajectory_queue.clone();
        thread::spawn(move || {
            let mut games = 0usize;
            let mut positions = 0usize;
            while let Some(trajectory) = trajectory_queue.pop(None) {
                games += 1;
                positions += trajectory.states.len();
            }
            (games, positions)
        })
    };

    let evaluation: Arc<dyn Evaluation<Game>> = evaluator.clone();
    let mut params = MctsParams::new(args.sim_num, evaluation);
    params.explore_factor = args.explore_factor;
    params.prior_noise_alpha = args.prior_noise_alpha;
    params.prior_noise_epsilon = args.prior_noise_epsilon;

    log::info!(
        "starting self play: {} games, {} actors, batch size {}, {} inference threads",
        args.games_num,
        args.actors,
        args.batch_size,
        args.inference_threads
    );
    let runner = SelfPlayRunner::new(
        Arc::new(PlayerBuilder { params }),
        trajectory_queue.clone(),
        stop.clone(),
        args.temperature_drop,
        args.actors,
    );
    let results = runner.generate_data(args.games_num);

    trajectory_queue.block_new_values();
    let (games, positions) = collector.join().unwrap();

    let cache_info = evaluator.cache_info();
    let batch_stats = evaluator.batch_size_stats();
    log::info!(
        "finished: {} wins (x) / {} wins (o) / {} draws, {} games, {} positions",
        results.w1,
        results.w2,
        results.d,
        games,
        positions
    );
    log::info!(
        "cache: {}/{} entries, {} hits, {} misses, {} evictions",
        cache_info.size,
        cache_info.capacity,
        cache_info.hits,
        cache_info.misses,
        cache_info.evictions
    );
    log::info!(
        "batches: {} total, avg size {:.2} (std {:.2}, max {})",
        batch_stats.num(),
        batch_stats.avg(),
        batch_stats.std_dev(),
        batch_stats.max()
    );

    if let Some(summary_file) = args.summary_file {
        let cache_uses = cache_info.hits + cache_info.misses;
        std::fs::write(
            &summary_file,
            serde_json::json!({
                "player1_wins": results.w1,
                "player2_wins": results.w2,
                "draws": results.d,
                "positions": positions,
                "batch_count": batch_stats.num(),
                "batch_size_average": batch_stats.avg(),
                "cache_hit_ratio": if cache_uses > 0 {
                    cache_info.hits as f64 / cache_uses as f64
                } else {
                    0.0
                },
            })
            .to_string(),
        )?;
    }

    Ok(())
}
