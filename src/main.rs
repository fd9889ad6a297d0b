mod block;
mod cli;
mod disk;
mod error;
mod mbr;
mod staging;
mod zealfs;

fn main() {
    env_logger::init();
    if let Err(err) = cli::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
