use rand::seq::IndexedRandom;

pub const FORTUNES: &[&str] = &[
    "Conquer your fears or they will conquer you.",
    "Rivers need springs.",
    "You will have a pleasant surprise.",
    "You are awesome.",
];

/// One fortune, picked uniformly at random.
pub fn random() -> &'static str {
    FORTUNES.choose(&mut rand::rng()).copied().unwrap_or("Rivers need springs.")
}
