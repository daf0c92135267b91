use rand::Rng;

/// Short random hex identifier, used for generated participant ids and
/// stream labels.
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}
