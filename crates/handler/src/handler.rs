use std::{convert::Infallible, net::SocketAddr, str::FromStr, sync::Arc, time::Instant};

use graphfed_planner::Request;
use http::{header::HeaderName, HeaderMap, StatusCode};
use serde_json::json;
use warp::{Filter, Rejection, Reply};

use crate::Engine;

#[derive(Clone)]
pub struct HandlerConfig {
    pub engine: Arc<Engine>,
    pub forward_headers: Arc<Vec<String>>,
}

fn do_forward_headers<T: AsRef<str>>(
    forward_headers: &[T],
    header_map: &HeaderMap,
    remote_addr: Option<SocketAddr>,
) -> HeaderMap {
    let mut new_header_map = HeaderMap::new();
    for name in forward_headers {
        for value in header_map.get_all(name.as_ref()) {
            if let Ok(name) = HeaderName::from_str(name.as_ref()) {
                new_header_map.append(name, value.clone());
            }
        }
    }
    if let Some(remote_addr) = remote_addr {
        if let Ok(remote_addr) = remote_addr.to_string().try_into() {
            new_header_map.append(http::header::FORWARDED, remote_addr);
        }
    }
    new_header_map
}

pub fn graphql_request(config: HandlerConfig) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::post()
        .and(warp::body::json())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and_then({
            move |request: Request, header_map: HeaderMap, remote_addr: Option<SocketAddr>| {
                let config = config.clone();
                async move {
                    let start_time = Instant::now();
                    let resp = config
                        .engine
                        .execute(
                            request,
                            do_forward_headers(&config.forward_headers, &header_map, remote_addr),
                        )
                        .await;

                    tracing::info!(
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        errors = resp.errors.len(),
                        "Query executed"
                    );

                    Ok::<_, Infallible>(warp::reply::json(&resp))
                }
            }
        })
}

pub fn health(engine: Arc<Engine>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get().map(move || {
        let status = match engine.is_healthy() {
            true => StatusCode::OK,
            false => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = json!({
            "status": engine.status(),
            "services": engine.service_health(),
        });
        warp::reply::with_status(warp::reply::json(&body), status)
    })
}

pub fn status(engine: Arc<Engine>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get().map(move || warp::reply::json(&engine.metrics()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn forwards_listed_headers_only() {
        let mut header_map = HeaderMap::new();
        header_map.insert("authorization", "Bearer t".parse().unwrap());
        header_map.insert("cookie", "a=b".parse().unwrap());

        let forwarded = do_forward_headers(
            &["authorization"],
            &header_map,
            Some("127.0.0.1:8000".parse().unwrap()),
        );
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded["authorization"], "Bearer t");
        assert_eq!(forwarded[http::header::FORWARDED], "127.0.0.1:8000");
    }
}
