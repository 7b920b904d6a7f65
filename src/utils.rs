/// Utility functions shared by the data pipeline and the evaluator
use candle_core::Device;

/// Pick the compute device for this rank
///
/// Tries Metal, then CUDA (ordinal = `local_rank`), and falls back to CPU when
/// neither backend is compiled in or initialization fails.
pub fn select_device(prefer_accelerator: bool, local_rank: usize) -> Device {
    if !prefer_accelerator {
        return Device::Cpu;
    }

    if candle_core::utils::metal_is_available() {
        match Device::new_metal(local_rank) {
            Ok(device) => return device,
            Err(e) => log::warn!("Metal device {} unavailable, falling back: {}", local_rank, e),
        }
    }

    if candle_core::utils::cuda_is_available() {
        match Device::new_cuda(local_rank) {
            Ok(device) => return device,
            Err(e) => log::warn!("CUDA device {} unavailable, falling back: {}", local_rank, e),
        }
    }

    Device::Cpu
}

/// Mix two values into a well-distributed 64-bit seed (splitmix64 finalizer)
pub fn mix_seed(a: u64, b: u64) -> u64 {
    let mut z = a ^ b.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
