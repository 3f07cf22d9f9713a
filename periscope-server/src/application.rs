//! Request validation and the `/profile` endpoint
//!
//! Concurrent remote requests are serialized by a connection-level gate
//! that is distinct from the coordinator's session lock: racing requests
//! get a fast 409 here instead of all piling onto the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use periscope::time::system_time_nanos;
use periscope::{ProfileMode, Profiler, SessionParams};
use serde_json::Value;
use tracing::warn;

use crate::config::ServerConfig;
use crate::request::{Request, Response};

const HTTP_OK: u16 = 200;
const HTTP_BAD_REQUEST: u16 = 400;
const HTTP_NOT_FOUND: u16 = 404;
const HTTP_NOT_ALLOWED: u16 = 405;
const HTTP_CONFLICT: u16 = 409;
const HTTP_INTERNAL_ERROR: u16 = 500;

pub struct ProfileApplication {
    profiler: Arc<Profiler>,
    default_duration: Duration,
    cors: bool,
    cors_host: String,
    profile_running: AtomicBool,
}

/// Resets the idle/profiling gate on every exit path of `handle`.
struct GateGuard<'a>(&'a AtomicBool);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProfileApplication {
    pub fn new(profiler: Arc<Profiler>, config: &ServerConfig) -> Self {
        Self {
            profiler,
            default_duration: config.default_duration,
            cors: config.cors,
            cors_host: config.cors_host.clone(),
            profile_running: AtomicBool::new(false),
        }
    }

    pub(crate) async fn handle(&self, request: &Request) -> Response {
        if request.method != "GET" {
            return Response::text(HTTP_NOT_ALLOWED, "Only GET requests are supported");
        }
        if request.path != "/profile" {
            return Response::text(
                HTTP_NOT_FOUND,
                format!("Unsupported endpoint {}", request.path),
            );
        }

        let (params, duration) = match self.validate_profile_params(request) {
            Ok(validated) => validated,
            Err(message) => {
                return Response::text(HTTP_BAD_REQUEST, format!("Invalid argument {message}"))
            }
        };

        if !self.start_running() {
            return Response::text(HTTP_CONFLICT, "A profile is already running");
        }
        let _gate = GateGuard(&self.profile_running);

        self.profile(params, duration).await
    }

    /// Drive one bounded profiling session. The connection's task blocks
    /// here for the whole requested duration: the caller waits for their
    /// own profile.
    async fn profile(&self, params: SessionParams, duration: Duration) -> Response {
        let start_time_nsecs = system_time_nanos();

        if !self.profiler.start(&params) {
            // A session the gate could not see, started in-process.
            return Response::text(HTTP_CONFLICT, "A profile is already running");
        }

        tokio::time::sleep(duration).await;

        self.profiler.stop();
        let Some(profile) = self.profiler.results() else {
            return Response::text(HTTP_INTERNAL_ERROR, "No profile was collected");
        };

        let mut body = profile.into_json();
        body["start_time_nsecs"] = Value::from(start_time_nsecs);

        match serde_json::to_vec(&body) {
            Ok(bytes) => {
                let mut response = Response::json(HTTP_OK, bytes);
                if self.cors {
                    response.header("Access-Control-Allow-Origin", self.cors_host.clone());
                }
                response
            }
            Err(err) => {
                warn!("failed to serialize profile: {}", err);
                Response::text(HTTP_INTERNAL_ERROR, "Profile serialization failed")
            }
        }
    }

    fn validate_profile_params(
        &self,
        request: &Request,
    ) -> Result<(SessionParams, Duration), String> {
        let mode = match request.query_param("mode") {
            Some(value) => value
                .parse::<ProfileMode>()
                .map_err(|_| format!("invalid mode {value}"))?,
            None => ProfileMode::Cpu,
        };

        let interval = match request.query_param("interval") {
            Some(value) => {
                let interval: i64 = value
                    .parse()
                    .map_err(|_| format!("invalid interval {value}"))?;
                if interval <= 0 || interval > i64::from(u32::MAX) {
                    return Err(format!("invalid interval {value}"));
                }
                interval as u32
            }
            None => mode.default_interval(),
        };

        let duration = match request.query_param("duration") {
            Some(value) => {
                let secs: f64 = value
                    .parse()
                    .map_err(|_| format!("invalid duration {value}"))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(format!("invalid duration {value}"));
                }
                Duration::from_secs_f64(secs)
            }
            None => self.default_duration,
        };

        let params = SessionParams {
            mode,
            interval,
            ignore_gc: false,
            metadata: serde_json::Map::new(),
        };
        Ok((params, duration))
    }

    /// Flip the idle→profiling gate. `false` means a remote profile is
    /// already in flight.
    fn start_running(&self) -> bool {
        self.profile_running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use periscope::engine::testing::FakeEngine;

    use super::*;

    fn application() -> ProfileApplication {
        let profiler = Arc::new(Profiler::new(Box::new(FakeEngine::new())));
        let config = ServerConfig {
            default_duration: Duration::from_millis(10),
            ..ServerConfig::default()
        };
        ProfileApplication::new(profiler, &config)
    }

    fn request(line: &str) -> Request {
        Request::parse(line).unwrap()
    }

    #[tokio::test]
    async fn test_non_get_is_method_not_allowed() {
        let app = application();
        let response = app.handle(&request("POST /profile?duration=1 HTTP/1.0")).await;
        assert_eq!(405, response.status);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let app = application();
        let response = app.handle(&request("GET /bad_endpoint HTTP/1.0")).await;
        assert_eq!(404, response.status);
    }

    #[tokio::test]
    async fn test_invalid_duration_is_bad_request() {
        let app = application();
        let response = app.handle(&request("GET /profile?duration=foo HTTP/1.0")).await;
        assert_eq!(400, response.status);
    }

    #[tokio::test]
    async fn test_invalid_mode_is_bad_request() {
        let app = application();
        let response = app
            .handle(&request("GET /profile?mode=unsupported_mode HTTP/1.0"))
            .await;
        assert_eq!(400, response.status);
    }

    #[tokio::test]
    async fn test_invalid_interval_is_bad_request() {
        let app = application();
        let response = app.handle(&request("GET /profile?interval=0 HTTP/1.0")).await;
        assert_eq!(400, response.status);
        let response = app
            .handle(&request("GET /profile?interval=-5 HTTP/1.0"))
            .await;
        assert_eq!(400, response.status);
    }

    #[tokio::test]
    async fn test_profile_defaults_to_cpu_mode() {
        let app = application();
        let response = app
            .handle(&request("GET /profile?duration=0.01 HTTP/1.0"))
            .await;
        assert_eq!(200, response.status);

        let text = String::from_utf8(response.into_bytes("HTTP/1.0")).unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        let profile: Value = serde_json::from_str(body).unwrap();
        assert_eq!(Some("cpu"), profile["mode"].as_str());
        assert!(profile["start_time_nsecs"].as_u64().is_some());
        assert!(!profile["samples"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_profile_honors_interval_and_mode() {
        let app = application();
        let response = app
            .handle(&request(
                "GET /profile?duration=0.01&mode=wall&interval=1000 HTTP/1.0",
            ))
            .await;
        assert_eq!(200, response.status);

        let text = String::from_utf8(response.into_bytes("HTTP/1.0")).unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        let profile: Value = serde_json::from_str(body).unwrap();
        assert_eq!(Some("wall"), profile["mode"].as_str());
        assert_eq!(Some(1000), profile["interval"].as_u64());
    }

    #[tokio::test]
    async fn test_cors_header_can_be_disabled() {
        let profiler = Arc::new(Profiler::new(Box::new(FakeEngine::new())));
        let config = ServerConfig {
            default_duration: Duration::from_millis(10),
            cors: false,
            ..ServerConfig::default()
        };
        let app = ProfileApplication::new(profiler, &config);

        let response = app
            .handle(&request("GET /profile?duration=0.01 HTTP/1.0"))
            .await;
        let text = String::from_utf8(response.into_bytes("HTTP/1.0")).unwrap();
        assert!(!text.contains("Access-Control-Allow-Origin"));
    }

    #[tokio::test]
    async fn test_overlapping_requests_conflict() {
        let app = Arc::new(application());

        let slow = {
            let app = Arc::clone(&app);
            tokio::spawn(async move {
                app.handle(&Request::parse("GET /profile?duration=0.2 HTTP/1.0").unwrap())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = app
            .handle(&request("GET /profile?duration=0.01 HTTP/1.0"))
            .await;
        assert_eq!(409, response.status);

        let slow = slow.await.unwrap();
        assert_eq!(200, slow.status);
    }

    #[tokio::test]
    async fn test_in_process_session_maps_to_conflict() {
        let profiler = Arc::new(Profiler::new(Box::new(FakeEngine::new())));
        let config = ServerConfig {
            default_duration: Duration::from_millis(10),
            ..ServerConfig::default()
        };
        let app = ProfileApplication::new(Arc::clone(&profiler), &config);

        assert!(profiler.start(&SessionParams::default()));
        let response = app
            .handle(&request("GET /profile?duration=0.01 HTTP/1.0"))
            .await;
        assert_eq!(409, response.status);
        assert!(profiler.stop());
    }
}
