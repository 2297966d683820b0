use weft::Executor;

/// Open an executor with `workers` threads and quiet logging.
pub fn pool(workers: usize) -> Executor {
    weft::logging::init_test();
    let exec = Executor::new();
    exec.open(workers);
    exec
}
