//! Small-object size classes: rounding, class lookup, per-class constants.

use log::error;

/// Requests larger than this bypass the front-end cache entirely and are
/// served directly by the page heap.
pub const SMALL_THRESHOLD: usize = 8192;

/// Number of distinct small size classes.
pub const NUM_SIZE_CLASSES: usize = 12;

/// Ascending table of small size classes. Two entries (48, 72) are not
/// powers of two; every other entry is.
pub const SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] =
    [16, 32, 48, 64, 72, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Round an arbitrary small request up to the nearest size class value.
///
/// Mirrors `round_request_size` from the original frontend: two explicit
/// non-power-of-two exceptions, then bit-smearing to the next power of two,
/// floored at 16.
pub fn round_request_size(size: usize) -> usize {
    if size > 32 && size <= 48 {
        return 48;
    }
    if size > 64 && size <= 72 {
        return 72;
    }

    let mut x = size;
    if x == 0 {
        return 16;
    }
    x -= 1;
    x |= x >> 1;
    x |= x >> 2;
    x |= x >> 4;
    x |= x >> 8;
    x |= x >> 16;
    x |= x >> 32;
    x += 1;

    x.max(16)
}

/// Map an already-rounded size to its class index, or `None` if it exceeds
/// `SMALL_THRESHOLD`.
///
/// An input that is not itself one of `SIZE_CLASSES` is a caller bug; we log
/// it and fall back to class 0 rather than panic, mirroring the defensive
/// behavior of `sc_index_from_size` in the original source.
pub fn class_index(rounded: usize) -> Option<usize> {
    if rounded > SMALL_THRESHOLD {
        return None;
    }

    match SIZE_CLASSES.iter().position(|&c| c == rounded) {
        Some(idx) => Some(idx),
        None => {
            error!("size_class: unnormalized size {rounded} reached class_index");
            Some(0)
        }
    }
}

/// The byte size served by a given class index.
pub fn class_size(idx: usize) -> usize {
    SIZE_CLASSES[idx]
}

/// Number of objects packed into one superblock of a given class.
///
/// Larger classes pack fewer, bigger pages; scaled up 4x for classes whose
/// block size is already >= 1024 so a superblock still spans a handful of
/// pages, matching `augment_size_class`'s objs_per_sb scaling.
pub fn objects_per_superblock(idx: usize, objects_per_sb: u16) -> u16 {
    if class_size(idx) >= 1024 {
        objects_per_sb.min(u16::from(u8::MAX) / 4) * 4
    } else {
        objects_per_sb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_exact_classes_to_themselves() {
        for &c in &SIZE_CLASSES {
            assert_eq!(round_request_size(c), c);
        }
    }

    #[test]
    fn rounds_boundary_cases() {
        assert_eq!(round_request_size(24), 32);
        assert_eq!(round_request_size(33), 48);
        assert_eq!(round_request_size(65), 72);
        assert_eq!(round_request_size(73), 128);
        assert_eq!(round_request_size(1), 16);
        assert_eq!(round_request_size(0), 16);
    }

    #[test]
    fn class_index_matches_table() {
        for (idx, &c) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(class_index(c), Some(idx));
        }
        assert_eq!(class_index(SMALL_THRESHOLD + 1), None);
    }

    #[test]
    fn class_size_round_trip() {
        for (idx, &c) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(class_size(idx), c);
        }
    }
}
