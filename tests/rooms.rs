mod fixture;
mod utils;

use std::sync::Arc;

use fixture::{connect_client, timeout_rcv, ClientHandle};
use serde_json::json;
use tokio::sync::mpsc;
use wiremux::{Frame, Server, Socket};

fn socket_channel(io: &Server) -> mpsc::UnboundedReceiver<Arc<Socket>> {
    let (tx, rx) = mpsc::unbounded_channel();
    io.on_connect(move |socket| {
        tx.send(socket).unwrap();
    });
    rx
}

/// Three clients on `/`, with their server-side sockets.
async fn three_clients(io: &Server) -> ([ClientHandle; 3], [Arc<Socket>; 3]) {
    let mut sockets = socket_channel(io);
    let a = connect_client(io, "conn-a").await;
    let sa = timeout_rcv(&mut sockets).await;
    let b = connect_client(io, "conn-b").await;
    let sb = timeout_rcv(&mut sockets).await;
    let c = connect_client(io, "conn-c").await;
    let sc = timeout_rcv(&mut sockets).await;
    ([a, b, c], [sa, sb, sc])
}

fn event_frame(event: &str, arg: impl Into<serde_json::Value>) -> Frame {
    Frame::Text(format!("2{}", json!([event, arg.into()])))
}

#[tokio::test]
async fn broadcast_to_room_excludes_sender() {
    let io = Server::new();
    let ([mut a, mut b, mut c], [sa, sb, sc]) = three_clients(&io).await;
    sa.join("r1");
    sb.join("r1");
    sc.join("r1");

    assert_ok!(sa.to("r1").emit("x", &1));

    assert_eq!(b.recv_frame().await, event_frame("x", 1));
    assert_eq!(c.recv_frame().await, event_frame("x", 1));
    a.assert_no_frame().await;
}

#[tokio::test]
async fn join_then_leave_stops_delivery() {
    let io = Server::new();
    let ([_a, mut b, _c], [sa, sb, _sc]) = three_clients(&io).await;
    sa.join("r1");
    sb.join("r1");

    assert_ok!(sa.to("r1").emit("x", &1));
    assert_eq!(b.recv_frame().await, event_frame("x", 1));

    sb.leave("r1");
    assert_ok!(sa.to("r1").emit("x", &2));
    b.assert_no_frame().await;
}

#[tokio::test]
async fn room_union_delivers_once() {
    let io = Server::new();
    let ([_a, mut b, _c], [sa, sb, _sc]) = three_clients(&io).await;
    sb.join(["r1", "r2"]);

    // A member of both targeted rooms receives the event exactly once.
    assert_ok!(sa.to("r1").to("r2").emit("x", &1));
    assert_eq!(b.recv_frame().await, event_frame("x", 1));
    b.assert_no_frame().await;
}

#[tokio::test]
async fn except_rooms_filter_targets() {
    let io = Server::new();
    let ([_a, mut b, mut c], [sa, sb, sc]) = three_clients(&io).await;
    sb.join("r1");
    sc.join(["r1", "muted"]);

    assert_ok!(sa.to("r1").except("muted").emit("x", &1));
    assert_eq!(b.recv_frame().await, event_frame("x", 1));
    c.assert_no_frame().await;
}

#[tokio::test]
async fn broadcast_without_rooms_reaches_namespace() {
    let io = Server::new();
    let ([mut a, mut b, mut c], [sa, _sb, _sc]) = three_clients(&io).await;

    assert_ok!(sa.broadcast().emit("x", &1));
    assert_eq!(b.recv_frame().await, event_frame("x", 1));
    assert_eq!(c.recv_frame().await, event_frame("x", 1));
    a.assert_no_frame().await;
}

#[tokio::test]
async fn namespace_emit_includes_everyone() {
    let io = Server::new();
    let ([mut a, mut b, mut c], _sockets) = three_clients(&io).await;

    assert_ok!(io.emit("x", &1));
    assert_eq!(a.recv_frame().await, event_frame("x", 1));
    assert_eq!(b.recv_frame().await, event_frame("x", 1));
    assert_eq!(c.recv_frame().await, event_frame("x", 1));
}

#[tokio::test]
async fn emit_to_socket_id_room() {
    let io = Server::new();
    let ([_a, mut b, mut c], [sa, sb, _sc]) = three_clients(&io).await;

    // Every socket is implicitly a member of the room named by its id.
    assert_ok!(sa.to(sb.id.clone()).emit("direct", &1));
    assert_eq!(b.recv_frame().await, event_frame("direct", 1));
    c.assert_no_frame().await;
}

#[tokio::test]
async fn volatile_broadcast_skips_unwritable_transports() {
    let io = Server::new();
    let ([_a, mut b, mut c], [sa, sb, sc]) = three_clients(&io).await;
    sb.join("r1");
    sc.join("r1");
    c.conn.set_writable(false);

    assert_ok!(sa.to("r1").volatile().emit("x", &1));
    assert_eq!(b.recv_frame().await, event_frame("x", 1));
    c.assert_no_frame().await;

    // A regular broadcast still reaches the slow transport.
    assert_ok!(sa.to("r1").emit("x", &2));
    assert_eq!(b.recv_frame().await, event_frame("x", 2));
    assert_eq!(c.recv_frame().await, event_frame("x", 2));
}

#[tokio::test]
async fn local_broadcast_is_noop_on_single_node() {
    let io = Server::new();
    let ([_a, mut b, _c], [sa, sb, _sc]) = three_clients(&io).await;
    sb.join("r1");

    assert_ok!(sa.to("r1").local().emit("x", &1));
    assert_eq!(b.recv_frame().await, event_frame("x", 1));
}

#[tokio::test]
async fn all_sockets_spans_targeted_rooms() {
    let io = Server::new();
    let (_handles, [sa, sb, sc]) = three_clients(&io).await;
    sa.join("r1");
    sb.join("r2");

    let all = io.of("/").all_sockets().await;
    assert_eq!(all.len(), 3);

    let in_rooms = io.to("r1").to("r2").all_sockets().await;
    assert_eq!(in_rooms.len(), 2);
    assert!(in_rooms.contains(&sa.id));
    assert!(in_rooms.contains(&sb.id));
    assert!(!in_rooms.contains(&sc.id));
}

#[tokio::test]
async fn operator_join_and_leave_by_selection() {
    let io = Server::new();
    let ([_a, mut b, _c], [_sa, sb, _sc]) = three_clients(&io).await;
    sb.join("r1");

    // Everyone in r1 also joins r2.
    io.to("r1").join("r2");
    assert!(sb.rooms().contains("r2"));

    assert_ok!(io.to("r2").emit("x", &1));
    assert_eq!(b.recv_frame().await, event_frame("x", 1));

    io.to("r1").leave("r2");
    assert!(!sb.rooms().contains("r2"));
}

#[tokio::test]
async fn socket_rooms_accessor() {
    let io = Server::new();
    let (_handles, [sa, _sb, _sc]) = three_clients(&io).await;
    sa.join(["a", "b"]);

    let rooms = sa.rooms();
    // Implicit own-id room plus the two joined ones.
    assert_eq!(rooms.len(), 3);
    assert!(rooms.contains("a"));
    assert!(rooms.contains("b"));
    assert!(rooms.contains(sa.id.as_str()));
}

#[tokio::test]
async fn parent_namespace_broadcast_fans_out_to_children() {
    let io = Server::new();
    let parent = io.of_regex(regex::Regex::new(r"^/room-\d+$").unwrap());

    let mut h1 = connect_client(&io, "conn-1").await;
    fixture::join_ns(&mut h1, "/room-1").await;
    let mut h2 = connect_client(&io, "conn-2").await;
    fixture::join_ns(&mut h2, "/room-2").await;

    assert_ok!(parent.emit("announce", &"hi"));
    assert_eq!(
        h1.recv_frame().await,
        Frame::Text(format!("2/room-1,{}", json!(["announce", "hi"])))
    );
    assert_eq!(
        h2.recv_frame().await,
        Frame::Text(format!("2/room-2,{}", json!(["announce", "hi"])))
    );
}
