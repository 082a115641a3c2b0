#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);

    let _ = mcp_kit_proto::sse_data_events(&s);
    let _ = mcp_kit_proto::first_sse_json(&s);
    let _ = serde_json::from_str::<mcp_kit_proto::JsonRpcMessage>(&s);
});
