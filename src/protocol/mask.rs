#![allow(
    clippy::cast_ptr_alignment,
    clippy::ptr_as_ptr,
    clippy::cast_possible_wrap
)]

/// XORs `payload` with `mask_key`, as if `payload` started at byte `offset` of the frame's
/// payload. Masking is its own inverse so this both masks and unmasks.
pub(crate) fn mask_from(payload: &mut [u8], mask_key: [u8; 4], offset: usize) {
    let key = rotate(mask_key, offset);

    #[cfg(all(target_arch = "x86_64", feature = "simd_masking"))]
    if is_x86_feature_detected!("avx2") {
        mask_avx2(payload, key);
    } else {
        mask_lin(payload, key);
    }

    #[cfg(not(all(target_arch = "x86_64", feature = "simd_masking")))]
    mask_lin(payload, key);
}

pub(crate) fn mask(payload: &mut [u8], mask_key: [u8; 4]) { mask_from(payload, mask_key, 0); }

// key as seen from `offset`, so the inner loops can always start at index 0
fn rotate(mask_key: [u8; 4], offset: usize) -> [u8; 4] {
    let mut key = mask_key;
    key.rotate_left(offset % 4);
    key
}

#[cfg(all(target_arch = "x86_64", feature = "simd_masking"))]
fn mask_avx2(payload: &mut [u8], mask_key: [u8; 4]) {
    use std::arch::x86_64::{
        __m256i, _mm256_loadu_si256, _mm256_set1_epi32, _mm256_storeu_si256, _mm256_xor_si256,
    };

    let len = payload.len();
    let mask32 = u32::from_le_bytes(mask_key) as i32;
    // SAFETY: avx2 support was checked by the caller
    let mask256 = unsafe { _mm256_set1_epi32(mask32) };

    let mut i = 0;
    // SAFETY: every load and store covers payload[i..i + 32], which is in bounds
    unsafe {
        while i + 32 <= len {
            let ptr = payload.as_mut_ptr().add(i) as *mut __m256i;
            let data = _mm256_loadu_si256(ptr);
            let masked = _mm256_xor_si256(data, mask256);
            _mm256_storeu_si256(ptr, masked);
            i += 32;
        }
    }

    // tail < 32 bytes fallback, 32 is a multiple of 4 so the key lines up
    mask_lin(&mut payload[i..], mask_key);
}

fn mask_lin(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, b) in payload.iter_mut().enumerate() {
        *b ^= mask_key[i % 4];
    }
}
