use std::sync::LazyLock;

use clap::Parser;

/// Settings of the lock stress driver.
#[derive(Parser, Debug, Clone)]
#[clap(about = "Hammer object monitors from many threads and check the results")]
pub struct Options {
    /// Number of worker threads.
    #[clap(long, short = 't', default_value_t = 8)]
    pub threads: usize,

    /// Lock rounds per worker.
    #[clap(long, short = 'n', default_value_t = 100_000)]
    pub iterations: usize,

    /// Number of shared objects the workers pick from. Fewer objects means
    /// more contention.
    #[clap(long, short = 'o', default_value_t = 4)]
    pub objects: usize,

    /// Deepest nesting a worker enters one object with. Depths past the thin
    /// recursion bound force inflation.
    #[clap(long, default_value_t = 4)]
    pub max_recursion: usize,

    /// Seed for the workers' random choices; worker `i` uses `seed + i`.
    #[clap(long, default_value_t = 0x5eed)]
    pub seed: u64,

    /// Check counters and lock words after the run.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub verify: bool,
}

pub static OPTIONS: LazyLock<Options> = LazyLock::new(Options::parse);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let options = Options::parse_from(["thinlock"]);
        assert_eq!(options.threads, 8);
        assert!(options.verify);

        let options = Options::parse_from([
            "thinlock",
            "--threads",
            "2",
            "-o",
            "1",
            "--max-recursion",
            "300",
            "--verify",
            "false",
        ]);
        assert_eq!(options.threads, 2);
        assert_eq!(options.objects, 1);
        assert_eq!(options.max_recursion, 300);
        assert!(!options.verify);
    }
}
