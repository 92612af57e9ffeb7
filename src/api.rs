pub mod activities;
pub mod enrollments;
pub mod students;

mod helper;
