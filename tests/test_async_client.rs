use std::{collections::HashMap, time::Duration};

use hip::{
    http::{header, StatusCode},
    AsyncPoolManager, AsyncRequestOptions, Error, PoolManagerBuilder, Retry, Timeout,
};

mod support;

#[actix_rt::test]
async fn test_simple() {
    let srv = support::start();
    let http = AsyncPoolManager::new();
    let url = format!("{}/", support::base(&srv));

    for _ in 0..3 {
        let res = http
            .request("GET", &url, AsyncRequestOptions::new())
            .await
            .unwrap();
        assert_eq!(res.text(), support::HELLO);
    }

    let pool = http.connection_from_url(&url).unwrap();
    assert_eq!(pool.num_connections(), 1);
    assert_eq!(pool.num_requests(), 3);

    let res = http
        .request(
            "POST",
            &format!("{}/echo", support::base(&srv)),
            AsyncRequestOptions::new().body("payload"),
        )
        .await
        .unwrap();
    assert_eq!(res.text(), "POST payload");
}

#[actix_rt::test]
async fn test_see_other_downgrades_to_get() {
    let srv = support::start();
    let http = AsyncPoolManager::new();

    let res = http
        .request(
            "PUT",
            &format!("{}/redirect?target=/echo&status=303", support::base(&srv)),
            AsyncRequestOptions::new().body("payload"),
        )
        .await
        .unwrap();
    assert_eq!(res.text(), "GET ");
}

#[actix_rt::test]
async fn test_cross_host_redirect_strips_authorization() {
    let srv = support::start();
    let http = AsyncPoolManager::new();

    let url = format!(
        "{}/redirect?target={}/echo_headers&status=301",
        support::base(&srv),
        support::alt_base(&srv)
    );
    let res = http
        .request(
            "GET",
            &url,
            AsyncRequestOptions::new().header(header::AUTHORIZATION, "foo"),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let headers: HashMap<String, String> = res.json().unwrap();
    assert!(!headers.contains_key("authorization"));
}

#[actix_rt::test]
async fn test_status_retry() {
    let srv = support::start();
    let http = AsyncPoolManager::new();

    let res = http
        .request(
            "GET",
            &format!("{}/successful_retry", support::base(&srv)),
            AsyncRequestOptions::new()
                .header("test-name", "test_async_status_retry")
                .retries(Retry::new(1).status_forcelist([418])),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let retry = Retry::new(1)
        .status_forcelist([418])
        .raise_on_status(false);
    let res = http
        .request(
            "GET",
            &format!("{}/status?status=418", support::base(&srv)),
            AsyncRequestOptions::new().retries(retry),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(res.retries().unwrap().history().len(), 1);
}

#[actix_rt::test]
async fn test_failed_connect_does_not_leak() {
    let port = support::closed_port();
    let http = PoolManagerBuilder::new()
        .maxsize(3)
        .finish_async()
        .unwrap();
    let url = format!("http://127.0.0.1:{}/", port);

    let err = http
        .request("GET", &url, AsyncRequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MaxRetry(_)));

    let pool = http.connection_from_url(&url).unwrap();
    assert_eq!(pool.idle_count() + pool.outstanding_count(), 3);
    assert_eq!(pool.outstanding_count(), 0);
}

#[actix_rt::test]
async fn test_pool_exhaustion() {
    let srv = support::start();
    let url = format!("{}/", support::base(&srv));

    let http = PoolManagerBuilder::new()
        .maxsize(1)
        .block(true)
        .pool_timeout(Duration::from_millis(50))
        .finish_async()
        .unwrap();
    let pool = http.connection_from_url(&url).unwrap();

    let conn = pool.acquire(None).await.unwrap();
    let err = http
        .request("GET", &url, AsyncRequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyPoolTimeout));

    conn.release(true);
    let res = http
        .request("GET", &url, AsyncRequestOptions::new())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[actix_rt::test]
async fn test_read_timeout() {
    let srv = support::start();
    let http = AsyncPoolManager::new();

    let err = http
        .request(
            "GET",
            &format!("{}/slow", support::base(&srv)),
            AsyncRequestOptions::new()
                .timeout(Timeout::new(None, Some(Duration::from_millis(50))))
                .retries(false),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadTimeout));
}

#[actix_rt::test]
async fn test_backend_selection() {
    let srv = support::start();

    let http = PoolManagerBuilder::new()
        .backend("tokio")
        .finish_async()
        .unwrap();
    let res = http
        .request(
            "GET",
            &format!("{}/", support::base(&srv)),
            AsyncRequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let err = PoolManagerBuilder::new()
        .backend("sync")
        .finish_async()
        .unwrap_err();
    assert_eq!(err.to_string(), "sync backend needs to be run in sync mode");
}
