use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global subscriber. Bad filter strings fall back to keeping
/// this crate at info rather than going silent.
pub fn init_tracing(filter: &str) {
    let env_filter =
        EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("driftcast_hub=info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();
    Registry::default().with(env_filter).with(fmt_layer).init();
}
