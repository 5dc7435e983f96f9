pub mod wav;

pub use wav::{downmix, read_wav, write_wav, AudioClip};
