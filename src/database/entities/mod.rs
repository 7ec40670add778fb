pub mod assets;
pub mod derivations;
pub mod persons;
pub mod training_runs;
