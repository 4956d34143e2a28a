use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use rescache::config::Metrics;
use rescache::metrics;
use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

#[derive(Debug, Default)]
pub struct Config {
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub http_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Where metrics are reported to.
#[derive(Debug, PartialEq, Eq)]
enum MetricsTarget {
    /// A local UDP sink that swallows everything.
    LocalSink,
    /// The statsd server from the configuration file.
    Statsd(String),
}

fn metrics_target(local_sink: bool, metrics: &Metrics) -> Option<MetricsTarget> {
    if local_sink {
        return Some(MetricsTarget::LocalSink);
    }
    metrics.statsd.clone().map(MetricsTarget::Statsd)
}

/// The configured custom tags, plus default tags to be closer to a real world config.
fn metrics_tags(metrics: &Metrics) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::from([
        ("host".to_owned(), "stresstest".to_owned()),
        ("env".to_owned(), "stresstest".to_owned()),
    ]);
    tags.extend(metrics.custom_tags.clone());
    tags
}

/// Sets up sentry, logging and metrics.
///
/// Sentry and, if requested, metrics report into local sinks that swallow everything. Without
/// `--tracing`, logging follows the `logging` section of `settings`, and metrics go to the
/// configured statsd server if there is one.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init(config: Config, settings: &rescache::config::Config) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.sentry {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).context("failed to bind sentry sink")?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.http_sink = Some(Box::pin(async move {
            async fn ok() -> &'static str {
                "OK"
            }
            use axum::handler::HandlerWithoutStateExt;

            let Ok(listener) = tokio::net::TcpListener::from_std(listener) else {
                return;
            };
            axum::serve(listener, ok.into_make_service()).await.ok();
        }));

        let dsn = format!("http://some_token@127.0.0.1:{}/1234", socket.port());

        guard.sentry = Some(sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                ..Default::default()
            },
        )));
    }

    if config.tracing {
        if settings.logging.enable_backtraces {
            // SAFETY: As documented, this function may only be called in a single-threaded context.
            unsafe { env::set_var("RUST_BACKTRACE", "1") };
        }

        let rust_log = "INFO";
        let subscriber = fmt()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_env_filter(rust_log);

        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        let subscriber = subscriber.with_writer(|| NoopWriter);

        // this should mimic the settings used in production:
        subscriber
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .finish()
            .with(sentry::integrations::tracing::layer())
            .init();
    } else {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { rescache::logging::init_logging(settings) };
    }

    let target = metrics_target(config.metrics, &settings.metrics);
    let host = match target {
        None => return Ok(guard),
        Some(MetricsTarget::Statsd(host)) => host,
        Some(MetricsTarget::LocalSink) => {
            let addr = SocketAddr::from(([127, 0, 0, 1], 0));
            let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
            listener.set_nonblocking(true)?;
            let socket = listener.local_addr()?;

            guard.udp_sink = Some(Box::pin(async move {
                let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                    return;
                };
                let mut buf = Vec::with_capacity(1024);
                loop {
                    buf.clear();
                    if listener.recv_buf(&mut buf).await.is_err() {
                        break;
                    }
                }
            }));

            format!("127.0.0.1:{}", socket.port())
        }
    };

    metrics::configure_statsd(
        &settings.metrics.prefix,
        host.as_str(),
        metrics_tags(&settings.metrics),
    )
    .context("failed to configure metrics")?;

    Ok(guard)
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
