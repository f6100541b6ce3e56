pub fn init_logger(override_filter: Option<&str>) {
  use tracing::metadata::LevelFilter;
  use tracing_subscriber::fmt::format::FmtSpan;
  use tracing_subscriber::{
    filter::Directive, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
  };

  // directives for debug builds
  #[cfg(debug_assertions)]
  let default_directive = Directive::from(LevelFilter::TRACE);

  #[cfg(debug_assertions)]
  let filter_directives = std::env::var("RUST_LOG")
    .ok()
    .or_else(|| override_filter.map(str::to_string))
    .unwrap_or_else(|| "dlflash_cli=trace,dlflash=trace".to_string());

  // directives for release builds
  #[cfg(not(debug_assertions))]
  let default_directive = Directive::from(LevelFilter::INFO);

  #[cfg(not(debug_assertions))]
  let filter_directives = std::env::var("RUST_LOG")
    .ok()
    .or_else(|| override_filter.map(str::to_string))
    .unwrap_or_else(|| "dlflash_cli=info,dlflash=info".to_string());

  let filter = EnvFilter::builder()
    .with_default_directive(default_directive)
    .parse_lossy(filter_directives);

  tracing_subscriber::registry()
    .with(fmt::layer().with_span_events(FmtSpan::CLOSE).with_filter(filter))
    .init();

  tracing::debug!("initialized logger");
}
