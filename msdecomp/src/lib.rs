// error types
pub mod error;

// chemistry module
pub mod chemistry {
    pub mod elements;
    pub mod formula;
}

// algorithm module
pub mod algorithm {
    pub mod params;
    pub mod residue;
    pub mod decomposer;
    pub mod parallel;
    pub mod spectrum;
}

// data module
pub mod data {
    pub mod spectrum;
}
