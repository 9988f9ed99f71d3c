pub mod backup;
pub mod classes;
pub mod core;
pub mod results;
pub mod schemas;
pub mod scores;
pub mod settings;
pub mod students;
