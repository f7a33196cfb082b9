//! Engine-level scenario tests exercising the full pipeline

mod scenario_tests;
