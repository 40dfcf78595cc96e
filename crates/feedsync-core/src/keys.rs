//! Key names used in the graph.
//!
//! User-space keys live under `~<pub>/`; [`HANDSHAKE_NODES`] lives at the
//! public root so that anyone can write requests into a handshake address.

/// `~me/storedReqs/<id>`: requests this user sent, pending acceptance
pub const STORED_REQS: &str = "storedReqs";

/// `handshakeNodes/<address>/<request id>`: public handshake inboxes
pub const HANDSHAKE_NODES: &str = "handshakeNodes";

/// `~me/outgoings/<feed id>`: feeds this user writes for a peer
pub const OUTGOINGS: &str = "outgoings";

/// `~me/outgoings/<feed id>/messages/<message id>`
pub const MESSAGES: &str = "messages";

/// `~me/userToIncoming/<peer pub>`: encrypted id of the peer's feed for us
pub const USER_TO_INCOMING: &str = "userToIncoming";

/// `~me/recipientToOutgoing/<peer pub>`: encrypted id of our feed for the peer
pub const RECIPIENT_TO_OUTGOING: &str = "recipientToOutgoing";

/// `~me/userToLastRequestSent/<peer pub>`: id of the latest request sent
pub const USER_TO_LAST_REQUEST_SENT: &str = "userToLastRequestSent";

/// `~me/currentHandshakeAddress`
pub const CURRENT_HANDSHAKE_ADDRESS: &str = "currentHandshakeAddress";

/// `~me/seedBackup`
pub const SEED_BACKUP: &str = "seedBackup";

/// `~me/epub`: published encryption key
pub const EPUB: &str = "epub";
