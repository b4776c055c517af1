use {super::Xorshift32, std::path::PathBuf};

/// Infinite iterator of socket paths under `/tmp`.
#[derive(Copy, Clone, Debug)]
pub struct NameGen {
    rng: Xorshift32,
}
impl NameGen {
    pub fn new(id: &'static str) -> Self { Self { rng: Xorshift32::from_id(id) } }
}
impl Iterator for NameGen {
    type Item = PathBuf;
    fn next(&mut self) -> Option<Self::Item> {
        Some(PathBuf::from(format!("/tmp/fdpass-test-{:08x}.sock", self.rng.next())))
    }
}

macro_rules! make_id {
    () => {
        concat!(file!(), line!(), column!())
    };
}
