use std::env;
use std::sync::Once;
use tracing::{Dispatch, dispatcher};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

static INIT: Once = Once::new();

/// Maps the numeric `RSMI_LOGGING` level onto a tracing level.
#[must_use]
pub const fn level_for(logging_level: u32) -> Option<LevelFilter> {
    match logging_level {
        0 => None,
        1 => Some(LevelFilter::WARN),
        2 => Some(LevelFilter::INFO),
        _ => Some(LevelFilter::TRACE),
    }
}

/// Installs a stderr subscriber the first time it is called with logging enabled.
///
/// `RSMI_LOG` directives (in `RUST_LOG` syntax) take priority over the numeric level. If the host
/// process already installed a global subscriber, ours is silently dropped.
pub fn init(logging_level: u32) {
    let directives = env::var("RSMI_LOG").ok().filter(|d| !d.is_empty());
    let Some(default_level) = level_for(logging_level) else {
        if directives.is_none() {
            return;
        }
        install(LevelFilter::WARN, directives);
        return;
    };
    install(default_level, directives);
}

fn install(default_level: LevelFilter, directives: Option<String>) {
    INIT.call_once(|| {
        let builder = EnvFilter::builder().with_default_directive(default_level.into());
        let filter = match directives {
            Some(d) => builder.parse_lossy(d),
            None => builder.parse_lossy(""),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .finish();

        let dispatch: Dispatch = subscriber.into();
        let _ = dispatcher::set_global_default(dispatch);
    });
}
