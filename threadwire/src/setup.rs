use threadwire_config::Config;

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        threadwire_log::debug!("launching threadwire without config folder");
    } else {
        threadwire_log::debug!(
            "launching threadwire from config folder {}",
            config.path().display()
        );
    }

    threadwire_log::debug!("  pool: {} x {}", config.pool_name(), config.pool_size());
    threadwire_log::debug!("  init timeout: {:?}", config.init_timeout());
    match config.worker_program() {
        Some(program) => threadwire_log::debug!("  worker: {}", program.display()),
        None => threadwire_log::debug!("  worker: -"),
    };
    threadwire_log::debug!("  log level: {}", config.logging().level);
}
