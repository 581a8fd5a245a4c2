#![no_main]

use libfuzzer_sys::fuzz_target;
use trivia_lobby_client::protocol::ServerMessage;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = serde_json::from_slice::<ServerMessage>(data) else {
        return;
    };
    // Anything we accept must survive re-encoding.
    let json = serde_json::to_string(&message).expect("decoded message re-encodes");
    let again: ServerMessage = serde_json::from_str(&json).expect("re-encoded message decodes");
    assert_eq!(message.name(), again.name());
});
