mod common;
mod database_tests;
mod pipeline_tests;
