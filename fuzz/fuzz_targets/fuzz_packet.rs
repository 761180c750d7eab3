#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use payment_stream::config::ConnectionConfig;
use payment_stream::protocol::packet::{AmountTooLarge, Prepare, Reply, StreamPacket};
use payment_stream::transport::{DataHandler, LoopbackPlugin};
use payment_stream::{Connection, Role};
use std::sync::OnceLock;
use tokio::runtime::Runtime;

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new().expect("runtime"))
}

fn receiver() -> &'static Connection {
    static RECEIVER: OnceLock<Connection> = OnceLock::new();
    RECEIVER.get_or_init(|| {
        let _guard = runtime().enter();
        let (plugin, _) = LoopbackPlugin::pair();
        Connection::open(Role::Server, plugin, ConnectionConfig::default())
    })
}

// Decoding is canonical, so re-encoding a decoded value reproduces the bytes it consumed
fn assert_prefix(data: &[u8], encoded: &[u8]) {
    assert!(encoded.len() <= data.len());
    assert_eq!(&data[..encoded.len()], encoded);
}

fuzz_target!(|data: &[u8]| {
    if let Ok(prepare) = Prepare::from_bytes(data.to_vec()) {
        assert_prefix(data, &prepare.to_bytes().expect("re-encode prepare"));
        if let Ok(packet) = StreamPacket::from_bytes(prepare.data.clone()) {
            let _ = packet.to_bytes().expect("re-encode stream packet");
        }
    }
    if let Ok(reply) = Reply::from_bytes(data.to_vec()) {
        // Reject messages are decoded lossily, so invalid UTF-8 cannot round-trip
        let lossy = matches!(&reply, Reply::Reject(reject) if reject.message.contains('\u{FFFD}'));
        if !lossy {
            assert_prefix(data, &reply.to_bytes().expect("re-encode reply"));
        }
    }
    if let Ok(details) = AmountTooLarge::from_bytes(data.to_vec()) {
        assert_prefix(data, &details.to_bytes().expect("re-encode details"));
    }

    // The receive path must answer any input without panicking
    let reply = receiver().handle_data(Bytes::copy_from_slice(data));
    assert!(Reply::from_bytes(reply).is_ok());
});
