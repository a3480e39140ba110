pub mod fingerprints;
pub mod healing;
