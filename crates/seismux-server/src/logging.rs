use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level for seismux crates when `RUST_LOG` is unset.
fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(level: &str) -> String {
    format!("seismux={level},seismux_server={level},seismux_mock_core={level}")
}

/// Install the global subscriber. Logs go to stderr; `LOG_FORMAT=json`
/// selects the JSON formatter.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("SEISMUX_LOG").ok();
        EnvFilter::new(filter_directives(base_level(level.as_deref())))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_level_accepts_aliases() {
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("debug")), "debug");
        assert_eq!(base_level(Some("verbose")), "info");
        assert_eq!(base_level(None), "info");
    }

    #[test]
    fn directives_cover_all_crates() {
        assert_eq!(
            filter_directives("warn"),
            "seismux=warn,seismux_server=warn,seismux_mock_core=warn"
        );
    }
}
