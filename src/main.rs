use clap::Parser;

fn main() {
    let args = bsgs::Args::parse();
    std::process::exit(bsgs::run(args));
}
