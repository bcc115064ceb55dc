//! Built-in probe kinds: `tcp` and `http`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use vigil_core::config::KindSpec;
use vigil_core::duration::parse_duration;
use vigil_health::{Probe, ProbeContext, ProbeOutcome, ProbeRegistry};

/// Register every built-in probe kind.
pub fn register(registry: &mut ProbeRegistry) {
    registry.register("tcp", tcp_probe);
    registry.register("http", http_probe);
}

fn degraded_after(spec: &KindSpec) -> anyhow::Result<Option<Duration>> {
    spec.str_param("degraded_after")
        .map(|s| parse_duration(s).with_context(|| format!("invalid degraded_after: {s}")))
        .transpose()
}

fn with_latency(
    outcome: ProbeOutcome,
    started: Instant,
    degraded_after: Option<Duration>,
) -> ProbeOutcome {
    let latency = started.elapsed();
    let outcome = match degraded_after {
        Some(limit) if latency > limit && outcome.status.is_passing() => {
            ProbeOutcome::degraded(format!("slow response ({}ms)", latency.as_millis()))
        }
        _ => outcome,
    };
    outcome.with_meta("response_ms", latency.as_secs_f64() * 1000.0)
}

/// Healthy when a TCP connection to `address` succeeds; degraded when it
/// takes longer than `degraded_after`.
fn tcp_probe(spec: &KindSpec) -> anyhow::Result<Arc<dyn Probe>> {
    let address = spec
        .str_param("address")
        .context("tcp probe requires `address`")?
        .to_string();
    let degraded_after = degraded_after(spec)?;

    Ok(Arc::new(move |_ctx: ProbeContext| {
        let address = address.clone();
        async move {
            let started = Instant::now();
            TcpStream::connect(&address)
                .await
                .with_context(|| format!("connect {address}"))?;
            Ok::<_, anyhow::Error>(with_latency(
                ProbeOutcome::healthy(format!("connected to {address}")),
                started,
                degraded_after,
            ))
        }
    }))
}

/// GET `path` on `address`: 2xx is healthy, 5xx critical, anything else
/// unhealthy.
fn http_probe(spec: &KindSpec) -> anyhow::Result<Arc<dyn Probe>> {
    let address = spec
        .str_param("address")
        .context("http probe requires `address`")?
        .to_string();
    let path = spec.str_param("path").unwrap_or("/").to_string();
    let degraded_after = degraded_after(spec)?;

    Ok(Arc::new(move |_ctx: ProbeContext| {
        let address = address.clone();
        let path = path.clone();
        async move {
            let started = Instant::now();
            let status = get(&address, &path).await?;
            let code = status.as_u16();
            let outcome = if status.is_success() {
                ProbeOutcome::healthy(format!("GET {path} returned {code}"))
            } else if status.is_server_error() {
                ProbeOutcome::critical(format!("GET {path} returned {code}"))
            } else {
                ProbeOutcome::unhealthy(format!("GET {path} returned {code}"))
            };
            Ok::<_, anyhow::Error>(
                with_latency(outcome, started, degraded_after).with_meta("status_code", code as f64),
            )
        }
    }))
}

async fn get(address: &str, path: &str) -> anyhow::Result<http::StatusCode> {
    let uri = format!("http://{address}{path}");
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("connect {address}"))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("http handshake failed")?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "http probe connection closed");
        }
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(&uri)
        .header("host", address)
        .header("user-agent", "vigild/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())?;

    let resp = sender
        .send_request(req)
        .await
        .with_context(|| format!("GET {uri}"))?;
    Ok(resp.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::watch;
    use vigil_core::HealthStatus;

    fn ctx() -> ProbeContext {
        let (_tx, rx) = watch::channel(false);
        ProbeContext::new("test", Instant::now() + Duration::from_secs(5), rx)
    }

    /// Serve one canned HTTP response per connection.
    async fn serve(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let resp = format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\n\r\n");
                let _ = socket.write_all(resp.as_bytes()).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn tcp_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let probe = tcp_probe(&KindSpec::new("tcp").with_param("address", addr.as_str())).unwrap();
        let outcome = probe.check(ctx()).await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Healthy);
        assert!(outcome.metadata.contains_key("response_ms"));
    }

    #[tokio::test]
    async fn tcp_probe_errors_when_refused() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let probe = tcp_probe(&KindSpec::new("tcp").with_param("address", addr.as_str())).unwrap();
        assert!(probe.check(ctx()).await.is_err());
    }

    #[test]
    fn tcp_probe_requires_address() {
        assert!(tcp_probe(&KindSpec::new("tcp")).is_err());
        let bad = KindSpec::new("tcp")
            .with_param("address", "127.0.0.1:1")
            .with_param("degraded_after", "soon");
        assert!(tcp_probe(&bad).is_err());
    }

    #[tokio::test]
    async fn http_probe_maps_status_codes() {
        let ok = serve("200 OK").await;
        let missing = serve("404 Not Found").await;
        let broken = serve("503 Service Unavailable").await;

        for (addr, expected) in [
            (ok, HealthStatus::Healthy),
            (missing, HealthStatus::Unhealthy),
            (broken, HealthStatus::Critical),
        ] {
            let spec = KindSpec::new("http")
                .with_param("address", addr.as_str())
                .with_param("path", "/healthz");
            let outcome = http_probe(&spec).unwrap().check(ctx()).await.unwrap();
            assert_eq!(outcome.status, expected, "{}", outcome.message);
        }
    }

    #[test]
    fn registers_builtin_kinds() {
        let mut registry = ProbeRegistry::new();
        register(&mut registry);
        assert_eq!(registry.kinds(), vec!["http".to_string(), "tcp".to_string()]);
    }
}
