mod admission_tests;
mod dispatch_tests;
mod teardown_tests;
