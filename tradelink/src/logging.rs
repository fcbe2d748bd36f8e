use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide fmt subscriber; `RUST_LOG` overrides the `info` default.
///
/// Returns `false` when another subscriber was already installed; that one is kept.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();
    if !installed {
        debug!("subscriber already installed, keeping it");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::init_logging;

    #[test]
    fn second_install_keeps_the_first_subscriber() {
        init_logging();
        assert!(!init_logging());
    }
}
