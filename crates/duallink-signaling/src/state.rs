/// Session lifecycle (spec §3 `SignalingSession`): `dial` yields
/// `Connected`; `subscribe` advances to `Subscribed`; `disconnect` or a
/// transport failure moves to `Closing` and the client is no longer usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Connected,
    Subscribed,
    Closing,
}
