mod fixture;
mod utils;

use std::sync::Arc;
use std::time::Duration;

use fixture::{connect_client, timeout_rcv};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use wiremux::{AckError, Frame, SendError, Server, Socket};

fn socket_channel(io: &Server) -> mpsc::UnboundedReceiver<Arc<Socket>> {
    let (tx, rx) = mpsc::unbounded_channel();
    io.on_connect(move |socket| {
        tx.send(socket).unwrap();
    });
    rx
}

#[tokio::test]
async fn ack_round_trip() {
    let io = Server::new();
    let mut sockets = socket_channel(&io);
    let mut handle = connect_client(&io, "conn-1").await;
    let socket = timeout_rcv(&mut sockets).await;

    let ack = assert_ok!(socket.emit_with_ack::<_, String>("ping", &"hi"));
    assert_eq!(
        handle.recv_frame().await,
        Frame::Text(format!("21{}", json!(["ping", "hi"])))
    );

    handle.send_str("31[\"pong\"]").await;
    let res = assert_ok!(ack.await);
    assert_eq!(res.data, "pong");
}

#[tokio::test]
async fn duplicate_ack_is_ignored() {
    let io = Server::new();
    let mut sockets = socket_channel(&io);
    let mut handle = connect_client(&io, "conn-1").await;
    let socket = timeout_rcv(&mut sockets).await;

    let ack = assert_ok!(socket.emit_with_ack::<_, String>("ping", &"hi"));
    handle.recv_frame().await;
    handle.send_str("31[\"pong\"]").await;
    assert_eq!(assert_ok!(ack.await).data, "pong");

    // The id was consumed: a replay is dropped without any side effect.
    handle.send_str("31[\"pong\"]").await;
    assert!(assert_some!(handle.client.socket("/")).connected());
    handle.assert_no_frame().await;
}

#[tokio::test]
async fn unknown_ack_id_is_ignored() {
    let io = Server::new();
    let handle = connect_client(&io, "conn-1").await;
    handle.send_str("399[\"pong\"]").await;
    assert!(assert_some!(handle.client.socket("/")).connected());
}

#[tokio::test]
async fn ack_timeout() {
    let io = Server::new();
    let mut sockets = socket_channel(&io);
    let mut handle = connect_client(&io, "conn-1").await;
    let socket = timeout_rcv(&mut sockets).await;

    let ack = assert_ok!(socket
        .timeout(Duration::from_millis(20))
        .emit_with_ack::<_, String>("ping", &"hi"));
    handle.recv_frame().await;

    // No reply: the stream resolves with a timeout error.
    let err = assert_err!(ack.await);
    assert!(matches!(err, AckError::Timeout));
}

#[tokio::test]
async fn ack_ids_are_monotonic_per_namespace() {
    let io = Server::new();
    let mut sockets = socket_channel(&io);

    let mut h1 = connect_client(&io, "conn-1").await;
    let s1 = timeout_rcv(&mut sockets).await;
    let mut h2 = connect_client(&io, "conn-2").await;
    let s2 = timeout_rcv(&mut sockets).await;

    // Ids come from one namespace-wide counter and are never reused.
    let _a1 = assert_ok!(s1.emit_with_ack::<_, Value>("ev", &0));
    assert_eq!(
        h1.recv_frame().await,
        Frame::Text(format!("21{}", json!(["ev", 0])))
    );
    let _a2 = assert_ok!(s2.emit_with_ack::<_, Value>("ev", &0));
    assert_eq!(
        h2.recv_frame().await,
        Frame::Text(format!("22{}", json!(["ev", 0])))
    );
    let _a3 = assert_ok!(s1.emit_with_ack::<_, Value>("ev", &0));
    assert_eq!(
        h1.recv_frame().await,
        Frame::Text(format!("23{}", json!(["ev", 0])))
    );
}

#[tokio::test]
async fn incoming_event_ack_is_single_shot() {
    let io = Server::new();
    io.on_connect(|socket| {
        socket.on("ping", |_socket, data: String, _bin, ack| async move {
            assert_eq!(data, "hi");
            // `send` consumes the sender: a second ack cannot be sent.
            ack.send(&"pong").ok();
        });
    });

    let mut handle = connect_client(&io, "conn-1").await;
    handle.send_str(format!("21{}", json!(["ping", "hi"]))).await;
    assert_eq!(handle.recv_frame().await, Frame::Text("31[\"pong\"]".to_string()));
    handle.assert_no_frame().await;
}

#[tokio::test]
async fn ack_sender_without_request_is_noop() {
    let io = Server::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    io.on_connect(move |socket| {
        let tx = tx.clone();
        socket.on("ping", move |_socket, _data: Value, _bin, ack| {
            let tx = tx.clone();
            async move {
                // The client did not ask for an ack: this is a no-op.
                assert_ok!(ack.send(&"pong"));
                tx.send(()).unwrap();
            }
        });
    });

    let mut handle = connect_client(&io, "conn-1").await;
    handle.send_str(format!("2{}", json!(["ping", 1]))).await;
    timeout_rcv(&mut rx).await;
    handle.assert_no_frame().await;
}

#[tokio::test]
async fn binary_ack_response() {
    let io = Server::new();
    io.on_connect(|socket| {
        socket.on("ping", |_socket, _data: Value, _bin, ack| async move {
            ack.bin(vec![bytes::Bytes::from_static(&[9])])
                .send(&"pong")
                .ok();
        });
    });

    let mut handle = connect_client(&io, "conn-1").await;
    handle.send_str(format!("24{}", json!(["ping", 1]))).await;
    assert_eq!(
        handle.recv_frame().await,
        Frame::Text(format!(
            "61-4{}",
            json!(["pong", {"_placeholder": true, "num": 0}])
        ))
    );
    assert_eq!(
        handle.recv_frame().await,
        Frame::Binary(bytes::Bytes::from_static(&[9]))
    );
}

#[tokio::test]
async fn reserved_event_cannot_request_ack() {
    let io = Server::new();
    let mut sockets = socket_channel(&io);
    let _handle = connect_client(&io, "conn-1").await;
    let socket = timeout_rcv(&mut sockets).await;

    let err = assert_err!(socket.emit_with_ack::<_, Value>("disconnect", &1));
    assert!(matches!(err, SendError::ReservedEvent));
}
