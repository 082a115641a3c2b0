use anyhow::Context as _;

/// Extract the `data:` payloads from an SSE body.
///
/// Events are blank-line delimited; multi-line `data:` fields within one
/// event are joined with `\n` per the SSE spec. Comments and unknown
/// fields are skipped.
pub fn sse_data_events(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut pending: Vec<&str> = Vec::new();

    for raw in body.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if line.is_empty() {
            if !pending.is_empty() {
                events.push(pending.join("\n"));
                pending.clear();
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            pending.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // ':' comments and other fields (event:, id:, retry:) are ignored.
    }

    if !pending.is_empty() {
        events.push(pending.join("\n"));
    }

    events
}

/// Decode the first SSE event of `body` as a JSON value.
pub fn first_sse_json(body: &str) -> anyhow::Result<serde_json::Value> {
    let events = sse_data_events(body);
    let first = events.first().context("sse body carried no events")?;
    serde_json::from_str(first).context("parse sse event data as json")
}
