pub mod assets;
pub mod derivations;
pub mod health;
pub mod objects;
pub mod persons;
pub mod training;
