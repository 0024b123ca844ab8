//! Generic behavior suite run against every virtnet realization.

use tokio_util::sync::CancellationToken;

use crate::common::Addr;
use crate::error::{Error, OpError};
use crate::net::{Conn, Networker};
use crate::virtnet::SubNetwork;

fn bg() -> CancellationToken {
    CancellationToken::new()
}

fn op_err(err: &Error) -> &OpError {
    match err {
        Error::Op(e) => e.as_ref(),
        other => panic!("expected network operation error, got: {other}"),
    }
}

async fn read_str(conn: &dyn Conn) -> String {
    let mut buf = vec![0u8; 4096];
    let n = conn.read(&mut buf).await.expect("read");
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

async fn write_str(conn: &dyn Conn, data: &str) {
    let mut done = 0;
    let data = data.as_bytes();
    while done < data.len() {
        done += conn.write(&data[done..]).await.expect("write");
    }
}

/// Basic dial/listen/accept exchange with exact address accounting.
pub(crate) async fn test_basic(subnet: SubNetwork) {
    let net = subnet.network();
    let addr = |host: &str, port: u32| Addr::new(net.clone(), host, port);

    let ha = subnet.new_host(&bg(), "α").await.expect("new host α");
    let hb = subnet.new_host(&bg(), "β").await.expect("new host β");

    assert_eq!(ha.network(), net);
    assert_eq!(hb.network(), net);
    assert_eq!(ha.name(), "α");
    assert_eq!(hb.name(), "β");

    // dialing port 0 picks a source port but is refused
    let err = ha.dial(&bg(), ":0").await.expect_err("dial :0");
    let oe = op_err(&err);
    assert_eq!(oe.op, "dial");
    assert_eq!(oe.net, net);
    assert_eq!(oe.source, Some(addr("α", 1)));
    assert_eq!(oe.addr, Some(addr("α", 0)));
    assert!(matches!(err.cause(), Error::ConnRefused));

    let l1 = ha.listen(&bg(), "").await.expect("listen");
    assert_eq!(l1.addr(), addr("α", 1));

    // port 0 stays unused even after autobind
    let err = ha.dial(&bg(), ":0").await.expect_err("dial :0 again");
    assert_eq!(op_err(&err).source, Some(addr("α", 2)));
    assert!(matches!(err.cause(), Error::ConnRefused));

    let srv_net = net.clone();
    let srv = tokio::spawn(async move {
        let addr = |host: &str, port: u32| Addr::new(srv_net.clone(), host, port);

        let c1s = l1.accept(&bg()).await.expect("accept 1");
        assert_eq!(c1s.local_addr(), addr("α", 2));
        assert_eq!(c1s.remote_addr(), addr("β", 1));
        assert_eq!(read_str(c1s.as_ref()).await, "ping");
        write_str(c1s.as_ref(), "pong").await;

        let c2s = l1.accept(&bg()).await.expect("accept 2");
        assert_eq!(c2s.local_addr(), addr("α", 3));
        assert_eq!(c2s.remote_addr(), addr("β", 2));
        assert_eq!(read_str(c2s.as_ref()).await, "hello");
        write_str(c2s.as_ref(), "world").await;

        (l1, c1s, c2s)
    });

    let c1c = hb.dial(&bg(), "α:1").await.expect("dial α:1");
    assert_eq!(c1c.local_addr(), addr("β", 1));
    assert_eq!(c1c.remote_addr(), addr("α", 2));
    write_str(c1c.as_ref(), "ping").await;
    assert_eq!(read_str(c1c.as_ref()).await, "pong");

    let c2c = hb.dial(&bg(), "α:1").await.expect("dial α:1 again");
    assert_eq!(c2c.local_addr(), addr("β", 2));
    assert_eq!(c2c.remote_addr(), addr("α", 3));
    write_str(c2c.as_ref(), "hello").await;
    assert_eq!(read_str(c2c.as_ref()).await, "world");

    let (_l1, _c1s, _c2s) = srv.await.expect("server task");

    // autobind allocates the next free port
    let l2 = ha.listen(&bg(), ":0").await.expect("listen again");
    assert_eq!(l2.addr(), addr("α", 4));

    subnet.close().await.expect("close");
}

/// Autobind reuses the smallest freed port.
pub(crate) async fn test_autobind_reuse(subnet: SubNetwork) {
    let net = subnet.network();
    let addr = |host: &str, port: u32| Addr::new(net.clone(), host, port);

    let ha = subnet.new_host(&bg(), "α").await.expect("new host");

    let l1 = ha.listen(&bg(), "").await.expect("listen 1");
    assert_eq!(l1.addr(), addr("α", 1));
    let l2 = ha.listen(&bg(), "").await.expect("listen 2");
    assert_eq!(l2.addr(), addr("α", 2));

    l1.close().await.expect("close l1");
    let l3 = ha.listen(&bg(), "").await.expect("listen 3");
    assert_eq!(l3.addr(), addr("α", 1));

    subnet.close().await.expect("close");
}

/// Byte sequences arrive in order and uncorrupted across many writes.
pub(crate) async fn test_byte_order(subnet: SubNetwork) {
    let ha = subnet.new_host(&bg(), "α").await.expect("new host α");
    let hb = subnet.new_host(&bg(), "β").await.expect("new host β");

    let l = ha.listen(&bg(), "").await.expect("listen");
    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();

    let want = payload.clone();
    let srv = tokio::spawn(async move {
        let c = l.accept(&bg()).await.expect("accept");
        let mut got = Vec::with_capacity(want.len());
        let mut buf = vec![0u8; 1500];
        while got.len() < want.len() {
            let n = c.read(&mut buf).await.expect("read");
            assert!(n > 0, "unexpected EOF");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, want);
        (l, c)
    });

    let c = hb.dial(&bg(), "α:1").await.expect("dial");
    let mut done = 0;
    while done < payload.len() {
        done += c.write(&payload[done..]).await.expect("write");
    }

    let (_l, _cs) = srv.await.expect("server task");
    subnet.close().await.expect("close");
}

/// Subnetwork close cascades into hosts, listeners and conns.
pub(crate) async fn test_shutdown_cascade(subnet: SubNetwork) {
    let ha = subnet.new_host(&bg(), "α").await.expect("new host α");
    let hb = subnet.new_host(&bg(), "β").await.expect("new host β");

    let l = ha.listen(&bg(), "").await.expect("listen");
    let srv = tokio::spawn(async move {
        let c = l.accept(&bg()).await.expect("accept");
        (l, c)
    });
    let cc = hb.dial(&bg(), "α:1").await.expect("dial");
    let (_l, cs) = srv.await.expect("server task");

    subnet.close().await.expect("close");

    let mut buf = [0u8; 16];
    for conn in [cc.as_ref(), cs.as_ref()] {
        let err = conn.read(&mut buf).await.expect_err("read after close");
        assert!(matches!(err.cause(), Error::NetDown), "got: {err}");
        let err = conn.write(b"x").await.expect_err("write after close");
        assert!(matches!(err.cause(), Error::NetDown), "got: {err}");
    }

    for host in [&ha, &hb] {
        let err = host.dial(&bg(), "α:1").await.expect_err("dial after close");
        assert!(matches!(err.cause(), Error::NetDown), "got: {err}");
        let err = host.listen(&bg(), "").await.expect_err("listen after close");
        assert!(matches!(err.cause(), Error::NetDown), "got: {err}");
    }
}
