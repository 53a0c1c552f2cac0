use spcore::aio::RecvBuf;
use spcore::stream::{prop, take_stream_output};
use spcore::{Aio, PropertyValue, SpUrl};
use websocket::{WsConfig, WsDialer, WsListener};

use spcore::{StreamDialer, StreamListener};
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = WsListener::for_url(
        &SpUrl::parse("ws://127.0.0.1:0/echo")?,
        WsConfig::default(),
    )?;
    listener.listen()?;
    let port = match listener.get(prop::LOCAL_ADDR)? {
        PropertyValue::Sockaddr(sa) => sa.port(),
        _ => anyhow::bail!("listener reported no socket address"),
    };
    info!("websocket echo on port {}", port);

    let acc = Aio::new_sync();
    listener.accept(&acc);

    let dialer = WsDialer::for_url(
        &SpUrl::parse(&format!("ws://127.0.0.1:{}/echo", port))?,
        WsConfig::default(),
    )?;
    let dial = Aio::new_sync();
    dialer.dial(&dial);

    dial.wait();
    acc.wait();
    dial.result()?;
    acc.result()?;
    let client = take_stream_output(&dial).expect("dial output carries the stream");
    let server = take_stream_output(&acc).expect("accept output carries the stream");

    let tx = Aio::new_sync();
    tx.set_iov(vec![bytes::Bytes::from_static(b"hello over ws")])?;
    client.send(&tx);
    tx.wait();
    tx.result()?;

    let rx = Aio::new_sync();
    rx.set_recv(RecvBuf::with_want(13));
    server.recv(&rx);
    rx.wait();
    rx.result()?;
    let got = rx.take_recv().expect("completed receive returns the buffer");
    info!("server got: {}", String::from_utf8_lossy(&got.buf));

    client.stop();
    server.stop();
    listener.close();
    Ok(())
}
