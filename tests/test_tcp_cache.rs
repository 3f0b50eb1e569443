//! The cache over real TCP connections to a local listener.

use std::time::Duration;

use apiconn::tcp::{self, TcpConnection};
use apiconn::{Cache, CancellationToken, EndpointInfo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accept connections forever, handing each server-side stream to the test.
async fn controller() -> (EndpointInfo, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let info = EndpointInfo::with_addresses([listener.local_addr().unwrap().to_string()]);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                break;
            }
        }
    });
    (info, rx)
}

#[tokio::test]
async fn test_tcp_connection_is_shared_and_replaced_after_hangup() {
    let (info, mut accepted) = controller().await;
    let cache: Cache<String, TcpConnection> = Cache::new();
    let cancel = CancellationToken::new();

    let dial = |info: EndpointInfo| move |token| tcp::dial(info, token);

    let h1 = cache
        .acquire(&cancel, "ctrl-A".to_string(), dial(info.clone()))
        .await
        .unwrap();
    let h2 = cache
        .acquire(&cancel, "ctrl-A".to_string(), dial(info.clone()))
        .await
        .unwrap();
    assert!(h1.same_connection(&h2));
    assert_eq!(h1.ref_count(), 3);

    let server_side = accepted.recv().await.unwrap();
    drop(h1);
    drop(h2);

    // The controller hangs up; the cache notices on next use
    drop(server_side);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let h3 = cache
        .acquire(&cancel, "ctrl-A".to_string(), dial(info.clone()))
        .await
        .unwrap();
    assert!(!h3.is_broken());
    assert!(accepted.recv().await.is_some(), "a second connection was dialed");
    assert_eq!(h3.ref_count(), 2);
}

#[tokio::test]
async fn test_unreachable_controller_reports_dial_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let cache: Cache<String, TcpConnection> = Cache::new();
    let info = EndpointInfo::with_addresses([addr]);
    let err = cache
        .acquire(&CancellationToken::new(), "ctrl-A".to_string(), move |token| {
            tcp::dial(info, token)
        })
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("cannot dial controller"), "got: {err}");
    assert!(cache.is_empty());
}
