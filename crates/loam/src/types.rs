//! Core identifier types.

/// Primary key of a persisted row, allocated by the engine's autoincrement
/// sequence on the base table of a type hierarchy.
pub type Id = i64;

/// Identity-map-local key, distinct from [`Id`], assigned when an object
/// enters the cache before any id is known.
pub type CacheKey = i64;

// The engine stores integer columns as 64-bit values; an `Id` wider than
// that could overflow the column at allocation time.
const _: () = assert!(std::mem::size_of::<Id>() == 8);
