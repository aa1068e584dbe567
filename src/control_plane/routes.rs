//! Route filters for the simulator-facing REST surface.
//!
//! Endpoints map one-to-one onto the lifecycle manager operations. Bodies
//! are tolerant of both wire dialects in the wild: urlencoded forms with a
//! `summaryresult`/`simlog` field, and plain JSON documents.

use bytes::{BufMut, Bytes};
use futures_util::StreamExt;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::{reply, Filter, Rejection, Reply};

use crate::control_plane::types::{ExecQuery, RunContext, StartClientConfig, TestRequestBody};
use crate::error_handling::types::LifecycleError;
use crate::lifecycle::types::{SuiteID, TestID, TestResult};
use crate::lifecycle::TestManager;

/// Uploads can carry chain data; allow up to 1 GiB per request.
const MAX_UPLOAD: u64 = 1 << 30;

/// The full API surface for one simulator run.
pub fn api(
    manager: Arc<TestManager>,
    ctx: Arc<RunContext>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    start_suite_route(manager.clone(), ctx)
        .or(end_suite_route(manager.clone()))
        .or(start_test_route(manager.clone()))
        .or(end_test_route(manager.clone()))
        .or(start_client_route(manager.clone()))
        .or(stop_client_route(manager.clone()))
        .or(enode_route(manager.clone()))
        .or(exec_route(manager.clone()))
        .or(create_network_route(manager.clone()))
        .or(remove_network_route(manager.clone()))
        .or(connect_container_route(manager.clone()))
        .or(disconnect_container_route(manager.clone()))
        .or(network_ip_route(manager.clone()))
        .or(clients_route(manager))
}

fn with_manager(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = (Arc<TestManager>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || manager.clone())
}

fn with_ctx(
    ctx: Arc<RunContext>,
) -> impl Filter<Extract = (Arc<RunContext>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// POST /testsuite
pub fn start_suite_route(
    manager: Arc<TestManager>,
    ctx: Arc<RunContext>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite")
        .and(warp::post())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::bytes())
        .and(with_manager(manager))
        .and(with_ctx(ctx))
        .and_then(
            |content_type: Option<String>,
             body: Bytes,
             manager: Arc<TestManager>,
             ctx: Arc<RunContext>| async move {
                let reply = match parse_start_request(&content_type, &body) {
                    Ok((name, description, simlog)) => {
                        let suite = manager.start_suite(
                            name,
                            description,
                            ctx.suite_log_path(&simlog),
                            ctx.simulator_container(),
                        );
                        ctx.register_suite(suite);
                        text_response(suite.to_string())
                    }
                    Err(msg) => bad_request(msg),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// DELETE /testsuite/{sid}
pub fn end_suite_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID)
        .and(warp::delete())
        .and(with_manager(manager))
        .and_then(|suite: SuiteID, manager: Arc<TestManager>| async move {
            let reply = match manager.end_suite(suite).await {
                Ok(()) => text_response(String::new()),
                Err(e) => error_response(&e),
            };
            Ok::<_, Rejection>(reply)
        })
}

/// POST /testsuite/{sid}/test
pub fn start_test_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "test")
        .and(warp::post())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::bytes())
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID,
             content_type: Option<String>,
             body: Bytes,
             manager: Arc<TestManager>| async move {
                let reply = match parse_start_request(&content_type, &body) {
                    Ok((name, description, _)) => {
                        match manager.start_test(suite, name, description) {
                            Ok(test) => text_response(test.to_string()),
                            Err(e) => error_response(&e),
                        }
                    }
                    Err(msg) => bad_request(msg),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// POST /testsuite/{sid}/test/{tid}
///
/// Results are POSTed rather than sent with DELETE because message bodies
/// on DELETE are not universally supported.
pub fn end_test_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "test" / TestID)
        .and(warp::post())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::bytes())
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID,
             test: TestID,
             content_type: Option<String>,
             body: Bytes,
             manager: Arc<TestManager>| async move {
                let reply = match parse_test_result(&content_type, &body) {
                    Ok(result) => match manager.end_test(suite, test, result).await {
                        Ok(()) => text_response(String::new()),
                        Err(e) => error_response(&e),
                    },
                    Err(msg) => bad_request(msg),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// POST /testsuite/{sid}/test/{tid}/node
pub fn start_client_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "test" / TestID / "node")
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_UPLOAD))
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID, test: TestID, form: FormData, manager: Arc<TestManager>| async move {
                Ok::<_, Rejection>(handle_start_client(suite, test, form, manager).await)
            },
        )
}

/// DELETE /testsuite/{sid}/test/{tid}/node/{nid}
pub fn stop_client_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "test" / TestID / "node" / String)
        .and(warp::delete())
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID, test: TestID, node: String, manager: Arc<TestManager>| async move {
                let reply = match manager.stop_client(suite, test, &node).await {
                    Ok(()) => text_response(String::new()),
                    Err(e) => error_response(&e),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// GET /testsuite/{sid}/test/{tid}/node/{nid}
pub fn enode_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "test" / TestID / "node" / String)
        .and(warp::get())
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID, test: TestID, node: String, manager: Arc<TestManager>| async move {
                let reply = match manager.client_enode_url(suite, test, &node).await {
                    Ok(enode) => text_response(enode),
                    Err(e) => error_response(&e),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// POST /testsuite/{sid}/test/{tid}/node/{nid}/exec
pub fn exec_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "test" / TestID / "node" / String / "exec")
        .and(warp::post())
        .and(warp::query::<ExecQuery>())
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID,
             test: TestID,
             node: String,
             query: ExecQuery,
             manager: Arc<TestManager>| async move {
                let reply = match manager
                    .run_program(suite, test, &node, &query.cmd, &query.user, query.privileged)
                    .await
                {
                    Ok(result) => reply::json(&result).into_response(),
                    Err(e) => error_response(&e),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// POST /testsuite/{sid}/network/{name}
pub fn create_network_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "network" / String)
        .and(warp::post())
        .and(with_manager(manager))
        .and_then(|suite: SuiteID, name: String, manager: Arc<TestManager>| async move {
            let reply = match manager.create_network(suite, &name).await {
                Ok(()) => text_response(String::new()),
                Err(e) => error_response(&e),
            };
            Ok::<_, Rejection>(reply)
        })
}

/// DELETE /testsuite/{sid}/network/{name}
pub fn remove_network_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "network" / String)
        .and(warp::delete())
        .and(with_manager(manager))
        .and_then(|suite: SuiteID, name: String, manager: Arc<TestManager>| async move {
            let reply = match manager.remove_network(suite, &name).await {
                Ok(()) => text_response(String::new()),
                Err(e) => error_response(&e),
            };
            Ok::<_, Rejection>(reply)
        })
}

/// POST /testsuite/{sid}/network/{name}/{cid}
pub fn connect_container_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "network" / String / String)
        .and(warp::post())
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID, name: String, container: String, manager: Arc<TestManager>| async move {
                let reply = match manager.connect_container(suite, &name, &container).await {
                    Ok(()) => text_response(String::new()),
                    Err(e) => error_response(&e),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// DELETE /testsuite/{sid}/network/{name}/{cid}
pub fn disconnect_container_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "network" / String / String)
        .and(warp::delete())
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID, name: String, container: String, manager: Arc<TestManager>| async move {
                let reply = match manager.disconnect_container(suite, &name, &container).await {
                    Ok(()) => text_response(String::new()),
                    Err(e) => error_response(&e),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// GET /testsuite/{sid}/network/{name}/{cid}
pub fn network_ip_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("testsuite" / SuiteID / "network" / String / String)
        .and(warp::get())
        .and(with_manager(manager))
        .and_then(
            |suite: SuiteID, name: String, container: String, manager: Arc<TestManager>| async move {
                let reply = match manager.container_network_ip(suite, &name, &container).await {
                    Ok(ip) => text_response(ip.to_string()),
                    Err(e) => error_response(&e),
                };
                Ok::<_, Rejection>(reply)
            },
        )
}

/// GET /clients
pub fn clients_route(
    manager: Arc<TestManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("clients")
        .and(warp::get())
        .and(with_manager(manager))
        .and_then(|manager: Arc<TestManager>| async move {
            Ok::<_, Rejection>(reply::json(&manager.client_definitions()).into_response())
        })
}

// ---- body handling --------------------------------------------------

async fn handle_start_client(
    suite: SuiteID,
    test: TestID,
    form: FormData,
    manager: Arc<TestManager>,
) -> warp::reply::Response {
    let mut env = HashMap::new();
    let mut files = HashMap::new();
    let mut tars = Vec::new();

    futures_util::pin_mut!(form);
    while let Some(item) = form.next().await {
        let part = match item {
            Ok(part) => part,
            Err(e) => return bad_request(format!("malformed multipart body: {}", e)),
        };
        let name = part.name().to_string();
        let filename = part.filename().map(|s| s.to_string());
        let content_type = part.content_type().map(|s| s.to_string());
        let data = match part_bytes(part).await {
            Ok(data) => data,
            Err(e) => return bad_request(format!("cannot read part {}: {}", name, e)),
        };

        if let Some(filename) = filename {
            // Tar archives are recognized by the SDK's part naming or an
            // explicit tar content type; everything else is a file mount
            // at the path given by the part name.
            let is_tar = filename.starts_with("hive_tar_")
                || content_type.as_deref().map(|ct| ct.contains("tar")).unwrap_or(false);
            if is_tar {
                tars.push(data);
            } else {
                files.insert(name, data);
            }
        } else if name == "config" {
            let config: StartClientConfig = match serde_json::from_slice(&data) {
                Ok(config) => config,
                Err(e) => return bad_request(format!("invalid config document: {}", e)),
            };
            if !config.client.is_empty() {
                env.insert("CLIENT".to_string(), config.client);
            }
            env.extend(config.environment);
        } else {
            env.insert(name, String::from_utf8_lossy(&data).into_owned());
        }
    }
    debug!(
        "suite {}: client start request ({} env vars, {} files, {} archives)",
        suite,
        env.len(),
        files.len(),
        tars.len()
    );

    match manager.start_client(suite, test, env, files, tars).await {
        Ok((id, ip)) => text_response(format!("{}@{}", id, ip)),
        Err(e) => error_response(&e),
    }
}

async fn part_bytes(mut part: Part) -> Result<Vec<u8>, warp::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = part.data().await {
        buf.put(chunk?);
    }
    Ok(buf)
}

fn is_json(content_type: &Option<String>) -> bool {
    content_type
        .as_deref()
        .map(|ct| ct.contains("json"))
        .unwrap_or(false)
}

/// Suite/test start bodies: `(name, description, simlog)`.
fn parse_start_request(
    content_type: &Option<String>,
    body: &[u8],
) -> Result<(String, String, String), String> {
    if is_json(content_type) {
        let req: TestRequestBody =
            serde_json::from_slice(body).map_err(|e| format!("invalid request body: {}", e))?;
        Ok((req.name, req.description, String::new()))
    } else {
        let fields: HashMap<String, String> = serde_urlencoded::from_bytes(body)
            .map_err(|e| format!("invalid form body: {}", e))?;
        Ok((
            fields.get("name").cloned().unwrap_or_default(),
            fields.get("description").cloned().unwrap_or_default(),
            fields.get("simlog").cloned().unwrap_or_default(),
        ))
    }
}

fn parse_test_result(content_type: &Option<String>, body: &[u8]) -> Result<TestResult, String> {
    if is_json(content_type) {
        serde_json::from_slice(body).map_err(|e| format!("invalid result body: {}", e))
    } else {
        let fields: HashMap<String, String> = serde_urlencoded::from_bytes(body)
            .map_err(|e| format!("invalid form body: {}", e))?;
        let raw = fields
            .get("summaryresult")
            .ok_or_else(|| "missing summaryresult field".to_string())?;
        serde_json::from_str(raw).map_err(|e| format!("invalid summaryresult: {}", e))
    }
}

// ---- replies ---------------------------------------------------------

fn text_response(body: String) -> warp::reply::Response {
    reply::with_status(body, StatusCode::OK).into_response()
}

fn bad_request(message: String) -> warp::reply::Response {
    reply::with_status(message, StatusCode::BAD_REQUEST).into_response()
}

fn error_response(err: &LifecycleError) -> warp::reply::Response {
    let status = if err.is_client_error() {
        match err {
            LifecycleError::UnknownSuite(_)
            | LifecycleError::UnknownTest(_)
            | LifecycleError::UnknownNode(_)
            | LifecycleError::UnknownNetwork(_)
            | LifecycleError::UnknownClientType(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    reply::with_status(err.to_string(), status).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::registry::{ClientDefinition, ClientMetadata};
    use crate::results::ResultWriter;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const BOUNDARY: &str = "hivehostboundary";

    fn new_api() -> (
        impl Filter<Extract = impl Reply, Error = Rejection> + Clone,
        Arc<TestManager>,
        Arc<MockBackend>,
        TempDir,
    ) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let clients = vec![
            ClientDefinition {
                name: "geth".to_string(),
                version: "1.10.3".to_string(),
                image: "hive/clients/geth".to_string(),
                meta: ClientMetadata::default(),
            },
            ClientDefinition {
                name: "parity".to_string(),
                version: "2.7.2".to_string(),
                image: "hive/clients/parity".to_string(),
                meta: ClientMetadata::default(),
            },
        ];
        let manager = Arc::new(TestManager::new(
            backend.clone(),
            clients,
            ResultWriter::new(dir.path()).unwrap(),
            "deadbeefcafe".to_string(),
        ));
        let ctx = Arc::new(RunContext::new(PathBuf::new()));
        (api(manager.clone(), ctx), manager, backend, dir)
    }

    struct TestPart<'a> {
        name: &'a str,
        filename: Option<&'a str>,
        body: &'a [u8],
    }

    fn multipart_body(parts: &[TestPart<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part.filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                        part.name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                        .as_bytes(),
                ),
            }
            body.extend_from_slice(part.body);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart_content_type() -> String {
        format!("multipart/form-data; boundary={}", BOUNDARY)
    }

    async fn start_suite_and_test(
        api: &(impl Filter<Extract = impl Reply, Error = Rejection> + Clone + 'static),
    ) -> (SuiteID, TestID) {
        let resp = warp::test::request()
            .method("POST")
            .path("/testsuite")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("name=smoke&description=sanity&simlog=simulator.log")
            .reply(api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let suite: SuiteID = std::str::from_utf8(resp.body()).unwrap().parse().unwrap();

        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/testsuite/{}/test", suite))
            .header("content-type", "application/x-www-form-urlencoded")
            .body("name=lifecycle&description=")
            .reply(api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let test: TestID = std::str::from_utf8(resp.body()).unwrap().parse().unwrap();
        (suite, test)
    }

    #[tokio::test]
    async fn test_suite_lifecycle_over_http() {
        let (api, manager, _backend, _dir) = new_api();
        let (suite, test) = start_suite_and_test(&api).await;

        let result = serde_json::to_string(&TestResult { pass: true, details: "ok".into() }).unwrap();
        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/testsuite/{}/test/{}", suite, test))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(serde_urlencoded::to_string([("summaryresult", result)]).unwrap())
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = warp::test::request()
            .method("DELETE")
            .path(&format!("/testsuite/{}", suite))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            manager.suite_status(suite),
            Some(crate::lifecycle::SuiteStatus::Written)
        );
    }

    #[tokio::test]
    async fn test_json_bodies_are_accepted() {
        let (api, _manager, _backend, _dir) = new_api();
        let resp = warp::test::request()
            .method("POST")
            .path("/testsuite")
            .header("content-type", "application/json")
            .body("{\"name\":\"smoke\",\"description\":\"sanity\"}")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(std::str::from_utf8(resp.body()).unwrap(), "0");
    }

    #[tokio::test]
    async fn test_missing_client_parameter_is_rejected() {
        let (api, _manager, backend, _dir) = new_api();
        let (suite, test) = start_suite_and_test(&api).await;

        let body = multipart_body(&[TestPart {
            name: "HIVE_BOOTNODE",
            filename: None,
            body: b"enode://aa@10.0.0.1:30303",
        }]);
        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/testsuite/{}/test/{}/node", suite, test))
            .header("content-type", multipart_content_type())
            .body(body)
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(std::str::from_utf8(resp.body()).unwrap().contains("CLIENT"));
        // No container was created for the bad request.
        assert_eq!(backend.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_client_with_form_fields() {
        let (api, _manager, backend, _dir) = new_api();
        let (suite, test) = start_suite_and_test(&api).await;

        let body = multipart_body(&[
            TestPart { name: "CLIENT", filename: None, body: b"geth" },
            TestPart {
                name: "/genesis.json",
                filename: Some("genesis.json"),
                body: b"{\"config\":{}}",
            },
        ]);
        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/testsuite/{}/test/{}/node", suite, test))
            .header("content-type", multipart_content_type())
            .body(body)
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let reply = std::str::from_utf8(resp.body()).unwrap();
        let (id, ip) = reply.split_once('@').expect("reply must be id@ip");
        assert!(!id.is_empty());
        assert!(ip.parse::<std::net::IpAddr>().is_ok());
        assert_eq!(backend.container_file_count(id), Some(1));
        assert_eq!(backend.container_env(id).unwrap().get("CLIENT").unwrap(), "geth");
    }

    #[tokio::test]
    async fn test_start_client_with_config_document() {
        let (api, _manager, backend, _dir) = new_api();
        let (suite, test) = start_suite_and_test(&api).await;

        let config = "{\"client\":\"parity\",\"environment\":{\"HIVE_NODETYPE\":\"full\"}}";
        let body = multipart_body(&[TestPart {
            name: "config",
            filename: None,
            body: config.as_bytes(),
        }]);
        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/testsuite/{}/test/{}/node", suite, test))
            .header("content-type", multipart_content_type())
            .body(body)
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let reply = std::str::from_utf8(resp.body()).unwrap();
        let (id, _) = reply.split_once('@').unwrap();
        let env = backend.container_env(id).unwrap();
        assert_eq!(env.get("CLIENT").unwrap(), "parity");
        assert_eq!(env.get("HIVE_NODETYPE").unwrap(), "full");
    }

    #[tokio::test]
    async fn test_tar_upload_is_recognized() {
        let (api, _manager, backend, _dir) = new_api();
        let (suite, test) = start_suite_and_test(&api).await;

        let body = multipart_body(&[
            TestPart { name: "CLIENT", filename: None, body: b"geth" },
            TestPart {
                name: "hive_tar_0",
                filename: Some("hive_tar_0"),
                body: b"fake tar bytes",
            },
        ]);
        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/testsuite/{}/test/{}/node", suite, test))
            .header("content-type", multipart_content_type())
            .body(body)
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let reply = std::str::from_utf8(resp.body()).unwrap();
        let (id, _) = reply.split_once('@').unwrap();
        // The archive counts as injected content, not an env var.
        assert_eq!(backend.container_file_count(id), Some(1));
        assert!(!backend.container_env(id).unwrap().contains_key("hive_tar_0"));
    }

    #[tokio::test]
    async fn test_exec_returns_json() {
        let (api, _manager, backend, _dir) = new_api();
        let (suite, test) = start_suite_and_test(&api).await;

        let body = multipart_body(&[TestPart { name: "CLIENT", filename: None, body: b"geth" }]);
        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/testsuite/{}/test/{}/node", suite, test))
            .header("content-type", multipart_content_type())
            .body(body)
            .reply(&api)
            .await;
        let reply = std::str::from_utf8(resp.body()).unwrap().to_string();
        let (id, _) = reply.split_once('@').unwrap();

        backend.set_exec_reply(crate::backend::ExecResult {
            stdout: "ok\n".into(),
            stderr: String::new(),
            exit_code: 0,
        });
        let resp = warp::test::request()
            .method("POST")
            .path(&format!(
                "/testsuite/{}/test/{}/node/{}/exec?cmd=hostname&user=&privileged=false",
                suite, test, id
            ))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(parsed["out"], "ok\n");
        assert_eq!(parsed["code"], 0);
    }

    #[tokio::test]
    async fn test_clients_listing() {
        let (api, _manager, _backend, _dir) = new_api();
        let resp = warp::test::request().method("GET").path("/clients").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let clients: Vec<ClientDefinition> = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(clients.len(), 2);
        assert!(clients.iter().any(|c| c.name == "geth"));
    }

    #[tokio::test]
    async fn test_reserved_and_unknown_names() {
        let (api, _manager, _backend, _dir) = new_api();
        let (suite, _test) = start_suite_and_test(&api).await;

        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/testsuite/{}/network/bridge", suite))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = warp::test::request()
            .method("POST")
            .path("/testsuite/999/test")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("name=t&description=")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
