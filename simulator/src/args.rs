use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Randomised workload driver for the sql-coordinator pool and transaction manager"
)]
pub(crate) struct Args {
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) duration: Option<Duration>,
    #[arg(long)]
    pub(crate) iterations: Option<u64>,
    #[arg(long)]
    pub(crate) seed: Option<u64>,
    #[arg(long, default_value_t = 4)]
    pub(crate) pool_size: usize,
    #[arg(long, default_value_t = 8)]
    pub(crate) tasks: usize,
    /// Chance that a task opening a frame asks for a savepoint instead of joining.
    #[arg(long, default_value_t = 0.4)]
    pub(crate) savepoint_rate: f64,
    /// Chance per step that every live session is killed.
    #[arg(long, default_value_t = 0.002)]
    pub(crate) kill_rate: f64,
    /// Chance that the next commit is made to fail.
    #[arg(long, default_value_t = 0.01)]
    pub(crate) commit_failure_rate: f64,
    #[arg(long, default_value_t = 0.05)]
    pub(crate) sleep_rate: f64,
    #[arg(long, default_value_t = 3)]
    pub(crate) max_depth: usize,
    #[arg(long)]
    pub(crate) log: Option<PathBuf>,
    #[arg(long)]
    pub(crate) quick: bool,
    #[arg(long)]
    pub(crate) stress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SimConfig {
    pub(crate) duration_ms: Option<u64>,
    pub(crate) iterations: Option<u64>,
    pub(crate) seed: u64,
    pub(crate) pool_size: usize,
    pub(crate) tasks: usize,
    pub(crate) savepoint_rate: f64,
    pub(crate) kill_rate: f64,
    pub(crate) commit_failure_rate: f64,
    pub(crate) sleep_rate: f64,
    pub(crate) max_depth: usize,
    pub(crate) log: Option<PathBuf>,
    pub(crate) preset: Option<String>,
    pub(crate) first_steps: usize,
    pub(crate) tail_steps: usize,
}

impl SimConfig {
    pub(crate) fn from_args(args: Args) -> Self {
        let mut config = SimConfig {
            duration_ms: args.duration.map(|d| d.as_millis() as u64),
            iterations: args.iterations,
            seed: args.seed.unwrap_or_else(random_seed),
            pool_size: args.pool_size.max(1),
            tasks: args.tasks.max(1),
            savepoint_rate: clamp_rate(args.savepoint_rate),
            kill_rate: clamp_rate(args.kill_rate),
            commit_failure_rate: clamp_rate(args.commit_failure_rate),
            sleep_rate: clamp_rate(args.sleep_rate),
            max_depth: args.max_depth.max(1),
            log: args.log,
            preset: None,
            first_steps: 30,
            tail_steps: 80,
        };

        if args.quick {
            config.apply_quick();
        }
        if args.stress {
            config.apply_stress();
        }

        config
    }

    fn apply_quick(&mut self) {
        self.preset = Some("quick".to_string());
        self.iterations = Some(10_000);
        self.duration_ms = None;
        self.pool_size = 2;
        self.tasks = 4;
        self.kill_rate = 0.001;
        self.commit_failure_rate = 0.01;
        self.sleep_rate = 0.05;
        self.max_depth = 2;
    }

    fn apply_stress(&mut self) {
        self.preset = Some("stress".to_string());
        self.iterations = Some(250_000);
        self.duration_ms = None;
        self.pool_size = 8;
        self.tasks = 32;
        self.savepoint_rate = 0.6;
        self.kill_rate = 0.005;
        self.commit_failure_rate = 0.03;
        self.sleep_rate = 0.08;
        self.max_depth = 5;
    }
}

fn clamp_rate(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs() ^ u64::from(now.subsec_nanos())
}
