use rotor_pool::StreamSettings;

/// How a response is delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One upstream call, one JSON completion.
    Buffered,
    /// Upstream streaming call, fragments forwarded as SSE chunks.
    RealStream,
    /// One buffered upstream call, re-chunked and paced as SSE chunks.
    FakeStream,
}

/// Selection table. A caller that does not ask for a stream always gets a
/// buffered response; when both flags are enabled, real streaming wins;
/// when neither is enabled, a stream request silently downgrades to
/// buffered.
pub fn select_mode(wants_stream: bool, settings: StreamSettings) -> DeliveryMode {
    if !wants_stream {
        return DeliveryMode::Buffered;
    }
    if settings.real_stream {
        DeliveryMode::RealStream
    } else if settings.fake_stream {
        DeliveryMode::FakeStream
    } else {
        DeliveryMode::Buffered
    }
}
