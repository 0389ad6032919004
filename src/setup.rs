use env_logger::Builder;
use log::LevelFilter;

/// Init the logger, later calls have no effect
pub fn init() {
    let mut builder = Builder::from_default_env();
    let _ = builder.filter(None, LevelFilter::Info).try_init();
}
