use std::time::{SystemTime, UNIX_EPOCH};

/// The 32-bit variant of the Xorshift PRNG algorithm.
#[repr(transparent)]
#[derive(Copy, Clone, Debug)]
pub struct Xorshift32(pub u32);
impl Xorshift32 {
    pub fn from_system_time() -> Self {
        let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_else(|e| e.duration());
        Self(dur.subsec_nanos())
    }
    /// Seeds from the given ID mixed with the system time and process ID, so that concurrently
    /// running tests and test binaries diverge.
    pub fn from_id(id: &str) -> Self {
        let mut seed = Self::from_system_time().0 ^ std::process::id().rotate_left(16);
        for b in id.bytes() {
            seed = (seed ^ u32::from(b)).wrapping_mul(0x0100_0193);
        }
        // Zero is a fixed point
        Self(if seed == 0 { 0x9e37_79b9 } else { seed })
    }
    pub fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
}
impl Iterator for Xorshift32 {
    type Item = u32;
    fn next(&mut self) -> Option<Self::Item> { Some(self.next()) }
}
