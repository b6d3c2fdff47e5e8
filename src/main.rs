extern crate pv;

use std::env;
use std::process;

fn main() {
    pv::init_logging();

    let control = match pv::cli::parse_control(env::args().collect()) {
        Ok(control) => control,
        Err(err) => {
            eprintln!("pv: {}", err);
            process::exit(2);
        }
    };

    match pv::run(control) {
        Ok(exit_status) => process::exit(exit_status as i32),
        Err(err) => {
            eprintln!("pv: {}", err);
            process::exit(err.exit_bit() as i32);
        }
    }
}
