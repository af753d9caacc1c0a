//! Process-wide tracing setup.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "GPT_LITE_LOG";

static INIT: OnceCell<()> = OnceCell::new();

/// Idempotent global setup. Installs a fmt subscriber filtered by
/// `GPT_LITE_LOG` (default `info`). A subscriber already installed by the
/// host application is left in place.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .is_ok();

        if installed {
            tracing::debug!("tracing initialized");
        }
    });
}
