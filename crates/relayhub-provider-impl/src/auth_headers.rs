use relayhub_provider_core::{Headers, header_set};

pub(crate) fn set_bearer(headers: &mut Headers, api_key: &str) {
    header_set(headers, "Authorization", format!("Bearer {api_key}"));
}

pub(crate) fn set_json_body(headers: &mut Headers, is_stream: bool) {
    header_set(headers, "Content-Type", "application/json");
    let accept = if is_stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    header_set(headers, "Accept", accept);
}
