#![allow(dead_code)]

use std::{collections::HashMap, net::TcpListener, sync::Mutex, time::Duration};

use actix_web::{
    http::{header, StatusCode},
    web, App, HttpRequest, HttpResponse,
};

pub const HELLO: &str = "Hello World";

type Counts = web::Data<Mutex<HashMap<String, usize>>>;
type Query = web::Query<HashMap<String, String>>;

/// Server with the handlers the client tests talk to.
pub fn start() -> actix_test::TestServer {
    let counts: Counts = web::Data::new(Mutex::new(HashMap::new()));

    actix_test::start(move || {
        App::new()
            .app_data(counts.clone())
            .route("/", web::to(|| async { HttpResponse::Ok().body(HELLO) }))
            .route("/status", web::to(status))
            .route("/redirect", web::to(redirect))
            .route("/echo", web::to(echo))
            .route("/echo_headers", web::to(echo_headers))
            .route("/query", web::to(query))
            .route("/slow", web::to(slow))
            .route("/successful_retry", web::to(successful_retry))
            .route("/retry_after", web::to(retry_after))
    })
}

/// Base URL addressing the server by IP.
pub fn base(srv: &actix_test::TestServer) -> String {
    format!("http://127.0.0.1:{}", srv.addr().port())
}

/// Base URL addressing the same server by another host name.
pub fn alt_base(srv: &actix_test::TestServer) -> String {
    format!("http://localhost:{}", srv.addr().port())
}

/// A local port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn code(query: &Query, default: u16) -> StatusCode {
    query
        .get("status")
        .and_then(|status| status.parse().ok())
        .and_then(|status| StatusCode::from_u16(status).ok())
        .unwrap_or_else(|| StatusCode::from_u16(default).unwrap())
}

async fn status(query: Query) -> HttpResponse {
    HttpResponse::build(code(&query, 200)).finish()
}

async fn redirect(query: Query) -> HttpResponse {
    let target = query.get("target").cloned().unwrap_or_else(|| "/".to_owned());

    HttpResponse::build(code(&query, 303))
        .insert_header((header::LOCATION, target.clone()))
        .body(format!("Redirecting to {}", target))
}

async fn echo(req: HttpRequest, body: web::Bytes) -> HttpResponse {
    HttpResponse::Ok().body(format!("{} {}", req.method(), String::from_utf8_lossy(&body)))
}

async fn echo_headers(req: HttpRequest) -> HttpResponse {
    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                value.to_str().unwrap_or_default().to_owned(),
            )
        })
        .collect();

    HttpResponse::Ok().json(headers)
}

async fn query(req: HttpRequest) -> HttpResponse {
    HttpResponse::Ok().body(req.query_string().to_owned())
}

async fn slow() -> HttpResponse {
    actix_rt::time::sleep(Duration::from_millis(500)).await;
    HttpResponse::Ok().body("slow")
}

fn hit(req: &HttpRequest, counts: &Counts) -> usize {
    let name = req
        .headers()
        .get("test-name")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let mut counts = counts.lock().unwrap();
    let count = counts.entry(format!("{}{}", req.path(), name)).or_insert(0);
    *count += 1;
    *count
}

/// 418 on the first request for a test name, 200 afterwards.
async fn successful_retry(req: HttpRequest, counts: Counts) -> HttpResponse {
    if hit(&req, &counts) == 1 {
        HttpResponse::build(StatusCode::IM_A_TEAPOT).body("Retry later")
    } else {
        HttpResponse::Ok().body("Success")
    }
}

/// 429 with `Retry-After: 1` on the first request for a test name, 200 afterwards.
async fn retry_after(req: HttpRequest, counts: Counts) -> HttpResponse {
    if hit(&req, &counts) == 1 {
        HttpResponse::build(StatusCode::TOO_MANY_REQUESTS)
            .insert_header((header::RETRY_AFTER, "1"))
            .body("Slow down")
    } else {
        HttpResponse::Ok().body("Success")
    }
}
