//! Content types: numeric tags naming an event's semantic kind.

/// Numeric tag naming the semantic kind of an event's payload.
pub type ContentType = u64;

/// Tombstone marking another event as deleted.
pub const DELETE: ContentType = 1;
/// A plain text post.
pub const POST: ContentType = 2;
/// LWW register: the account's display name.
pub const USERNAME: ContentType = 3;
/// LWW register: the account's profile description.
pub const DESCRIPTION: ContentType = 4;
/// LWW register: the account's avatar reference.
pub const AVATAR: ContentType = 5;
/// LWW element-set: accounts this system follows.
pub const FOLLOW: ContentType = 6;
/// LWW element-set: accounts this system blocks.
pub const BLOCK: ContentType = 7;
/// LWW element-set: sync servers this system announces.
pub const SERVER: ContentType = 8;
