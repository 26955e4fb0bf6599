use std::collections::BTreeMap;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::thread;

use anyhow::{Context, Result};
use backdrop_service::config::Config as ServiceConfig;
use backdrop_service::{logging, metrics};

#[derive(Debug, Default)]
pub struct Config {
    pub tracing: bool,
    pub metrics: bool,
}

pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Sets up logging and metrics.
///
/// # Safety
/// Must be called before any other thread is spawned, see [`logging::init_logging`].
pub unsafe fn init(config: Config, service_config: &ServiceConfig) -> Result<Guard> {
    let guard = Guard {
        _sentry: Some(logging::init_sentry(service_config)),
    };

    if config.tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void, mimicking the settings used in production:
        logging::init_json_logging("INFO", || NoopWriter);
    } else {
        // SAFETY: forwarded to the caller.
        unsafe { logging::init_logging(service_config) };
    }

    if let Some(ref host) = service_config.metrics.statsd {
        metrics::configure_statsd(
            &service_config.metrics.prefix,
            host.as_str(),
            service_config.metrics.custom_tags.clone(),
        )?;
    } else if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let socket = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
        let host = format!("127.0.0.1:{}", socket.local_addr()?.port());

        thread::Builder::new()
            .name("metrics-sink".into())
            .spawn(move || {
                let mut buf = [0; 1024];
                while socket.recv(&mut buf).is_ok() {}
            })
            .context("failed to spawn metrics sink")?;

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd(&service_config.metrics.prefix, host, tags)?;
    }

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
