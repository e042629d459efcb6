//! Generate a bcrypt hash for a `users.json` entry.

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "passage-hash", version, about = "Hash a password for users.json")]
struct Args {
    /// Password to hash; read from stdin when omitted.
    password: Option<String>,
    /// bcrypt cost factor.
    #[arg(long, default_value_t = 12)]
    cost: u32,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let password = match args.password {
        Some(p) => p,
        None => {
            let mut input = String::new();
            if std::io::stdin().read_to_string(&mut input).is_err() {
                eprintln!("error: failed to read password from stdin");
                return ExitCode::FAILURE;
            }
            input.trim_end_matches(['\r', '\n']).to_string()
        }
    };

    if password.is_empty() {
        eprintln!("error: password must not be empty");
        return ExitCode::FAILURE;
    }
    if args.cost < 10 {
        eprintln!("error: cost must be at least 10");
        return ExitCode::FAILURE;
    }

    match passage_auth::hash_password(&password, args.cost) {
        Ok(hash) => {
            println!("{hash}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
