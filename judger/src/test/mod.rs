mod evaluator_tests;
mod health_tests;
mod slot_tests;
mod util;
