// crashwatch-tests/examples/tester.rs
extern crate crashwatch_tests;

fn main() {
    if let Err(e) = crashwatch_tests::execute_tester_inner() {
        eprintln!("[TESTER MAIN] Fatal error: {:?}", e);
        std::process::exit(crashwatch_tests::SETUP_EXIT_CODE);
    }
}
