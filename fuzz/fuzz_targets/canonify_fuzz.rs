#![no_main]
use libfuzzer_sys::fuzz_target;
use vfsd::modules::namespace::{canonify, parent_of};

fuzz_target!(|data: &[u8]| {
    if let Ok(path) = std::str::from_utf8(data) {
        if let Ok(once) = canonify(path) {
            // Canonical paths are fixed points
            assert_eq!(canonify(&once).ok().as_deref(), Some(once.as_str()));
            assert!(once.starts_with('/'));
            assert!(once == "/" || !once.ends_with('/'));
            assert!(!once.contains("//"));

            let parent = parent_of(&once);
            assert!(once.starts_with(parent));
        }
    }
});
