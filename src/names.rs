//! Name pool for replication groups and shards.
//!
//! Unnamed groups draw a common english bird name from a pool that is
//! shuffled once per process, so concurrently built topologies get distinct,
//! human-readable names.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;

const BIRDS: &[&str] = &[
    "Avocet",
    "Bittern",
    "Brambling",
    "Bullfinch",
    "Chaffinch",
    "Chiffchaff",
    "Cormorant",
    "Curlew",
    "Dipper",
    "Dunlin",
    "Dunnock",
    "Fieldfare",
    "Firecrest",
    "Fulmar",
    "Gannet",
    "Goldcrest",
    "Goldfinch",
    "Goosander",
    "Goshawk",
    "Greenfinch",
    "Greenshank",
    "Guillemot",
    "Jackdaw",
    "Kestrel",
    "Kingfisher",
    "Kittiwake",
    "Lapwing",
    "Linnet",
    "Merlin",
    "Moorhen",
    "Nightjar",
    "Nuthatch",
    "Osprey",
    "Oystercatcher",
    "Peregrine",
    "Pipit",
    "Pochard",
    "Puffin",
    "Redpoll",
    "Redshank",
    "Redstart",
    "Redwing",
    "Sanderling",
    "Shelduck",
    "Siskin",
    "Skylark",
    "Sparrowhawk",
    "Starling",
    "Stonechat",
    "Swift",
    "Treecreeper",
    "Turnstone",
    "Twite",
    "Wagtail",
    "Waxwing",
    "Wheatear",
    "Whimbrel",
    "Whinchat",
    "Wigeon",
    "Woodcock",
    "Wryneck",
    "Yellowhammer",
];

static POOL: Lazy<Mutex<Vec<&'static str>>> = Lazy::new(|| {
    let mut names = BIRDS.to_vec();
    names.shuffle(&mut rand::thread_rng());
    Mutex::new(names)
});

static OVERFLOW: AtomicUsize = AtomicUsize::new(0);

/// Draws the next name from the shuffled pool.
pub(crate) fn next() -> String {
    match POOL.lock().unwrap().pop() {
        Some(name) => name.to_string(),
        // Pool exhausted; fall back to numbered names.
        None => format!("Group{}", OVERFLOW.fetch_add(1, Ordering::Relaxed)),
    }
}

/// Strips everything but ASCII alphanumerics so the name is a safe bare
/// token in the config grammar (sentinel monitor identifiers in particular).
pub(crate) fn sanitize(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn names_are_distinct() {
        let names: HashSet<String> = (0..10).map(|_| next()).collect();
        assert_eq!(names.len(), 10);
    }

    #[test]
    fn sanitize_strips_whitespace_and_punctuation() {
        assert_eq!(sanitize("Sea Eagle!"), "SeaEagle");
        assert_eq!(sanitize("shard-1"), "shard1");
        assert_eq!(sanitize("Puffin"), "Puffin");
    }
}
