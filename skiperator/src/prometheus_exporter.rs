use http_body_util::Full;
use hyper::{
    Request, Response, body::Bytes, header::CONTENT_TYPE, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Meter provider exporting all metrics into the given Prometheus registry.
pub(crate) fn meter_provider(registry: &Registry) -> anyhow::Result<SdkMeterProvider> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    Ok(SdkMeterProvider::builder().with_reader(exporter).build())
}

fn render(registry: &Registry, encoder: &TextEncoder) -> Result<Vec<u8>, prometheus::Error> {
    let metric_families = registry.gather();
    let mut result = Vec::new();
    encoder.encode(&metric_families, &mut result)?;
    Ok(result)
}

async fn serve_req<B>(
    _req: Request<B>,
    registry: Registry,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let encoder = TextEncoder::new();
    match render(&registry, &encoder) {
        Ok(result) => Response::builder()
            .status(200)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(result))),
        Err(e) => {
            error!("{}", e);
            Response::builder().status(500).body(Full::new(Bytes::new()))
        }
    }
}

pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    debug!("Listening on http://{}", addr);
    loop {
        let (stream, _) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve_req(req, registry.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use opentelemetry::{KeyValue, metrics::MeterProvider};

    #[tokio::test]
    async fn exports_otel_metrics() {
        let registry = Registry::new();
        let provider = meter_provider(&registry).unwrap();
        let counter = provider
            .meter("test")
            .u64_counter(crate::utils::metric_name("reconcile_count"))
            .build();
        counter.add(3, &[KeyValue::new("controller", "Workload")]);

        let response = serve_req(Request::new(()), registry).await.unwrap();
        assert_eq!(200, response.status());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("skiperator_reconcile_count"), "{}", body);
        assert!(body.contains(r#"controller="Workload""#), "{}", body);
    }
}
