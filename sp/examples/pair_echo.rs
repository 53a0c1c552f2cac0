use sp::{RawProtocol, Socket};
use spcore::{Aio, Message};
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Socket::new(Box::new(RawProtocol::pair()));
    let listener = server.listen("tcp://127.0.0.1:0")?;
    let port = listener.bound_port()?;
    info!("listening on port {}", port);

    let client = Socket::new(Box::new(RawProtocol::pair()));
    let dialer = client.dial(&format!("tcp://127.0.0.1:{}", port))?;
    dialer.wait_connected()?;

    // wait for both sides to see the pipe
    let (cp, sp) = loop {
        let (c, s) = (client.pipes(), server.pipes());
        if !c.is_empty() && !s.is_empty() {
            break (c[0].clone(), s[0].clone());
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    };

    for i in 0..5u32 {
        let aio = Aio::new_sync();
        aio.set_msg(Message::from_body(format!("ping {}", i).as_bytes()));
        cp.send(&aio);
        aio.wait();
        aio.result()?;

        let aio = Aio::new_sync();
        sp.recv(&aio);
        aio.wait();
        aio.result()?;
        let msg = aio.take_msg().expect("completed receive carries a message");
        info!("server got: {}", String::from_utf8_lossy(msg.body()));
    }

    client.close();
    server.close();
    Ok(())
}
