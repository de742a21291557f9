use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::builder::ValueParser;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::EnvFilter;

use dbgi::common::Image;
use dbgi::store::{DebugInfo, LoadOptions};

fn print_range(start: u64, end: u64, matches: &ArgMatches) {
    if matches.get_flag("ranges") {
        print!(" ({start:#x} - {end:#x})");
    }
}

fn print_file(info: &DebugInfo, file: dbgi::common::FileId, line: u32, matches: &ArgMatches) {
    let path = info.pools().file_path(file);
    let file = if matches.get_flag("basenames") {
        path.rsplit('/').next().unwrap_or_default()
    } else {
        path.as_str()
    };
    print!("{file}:{line}");
}

fn resolve(info: &DebugInfo, addr: u64, matches: &ArgMatches) {
    let strings = &info.pools().strings;

    if matches.get_flag("inlinees") {
        for record in info.lookup_inline_chain(addr).iter().rev() {
            if matches.get_flag("functions") {
                print!("{}", strings.get(record.name));
                print_range(record.range.start, record.range.end, matches);
                print!("\n  called from ");
            }
            print_file(info, record.call_file, record.call_line, matches);
            println!();
        }
    }

    if matches.get_flag("functions") {
        match info.lookup_symbol(addr) {
            Some(symbol) => {
                print!("{}", strings.get(symbol.name));
                print_range(symbol.address, symbol.end(), matches);
            }
            None => print!("??"),
        }
        print!("\n  at ");
    }

    match info.lookup_line(addr) {
        Some(record) => {
            print_file(info, record.file, record.line, matches);
            print_range(record.address, record.address + u64::from(record.size), matches);
        }
        None => print!("??:0"),
    }
    println!();

    if matches.get_flag("unwind") {
        let recipe = info.lookup_unwind_recipe(addr);
        println!("  unwind {}", info.display_recipe(recipe));
    }
}

fn execute(matches: &ArgMatches) -> Result<()> {
    let path = matches
        .get_one::<PathBuf>("path")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("a.out"));
    let image = Image::open(path).context("failed to open file")?;

    let options = LoadOptions {
        load_address: matches.get_one::<u64>("load_address").copied(),
        ..LoadOptions::default()
    };
    let info = DebugInfo::load(image, &options).context("failed to load file")?;

    for diagnostic in info.diagnostics().iter() {
        eprintln!("{diagnostic}");
    }

    for &addr in matches.get_many::<u64>("addrs").unwrap_or_default() {
        resolve(&info, addr, matches);
    }

    Ok(())
}

fn parse_addr(addr: &str) -> anyhow::Result<u64> {
    match addr.strip_prefix("0x") {
        Some(addr) => u64::from_str_radix(addr, 16),
        None => addr.parse(),
    }
    .context("unable to parse address")
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let about = r#"addr2line translates addresses into file names and line numbers. It loads the DWARF debug information and call frame information of an ELF file and prints, for each address, the source location and optionally the symbol, the chain of inlined calls and the unwind recipe.

Set RUST_LOG=debug to see what the loader is doing."#;
    let matches = Command::new("addr2line")
        .about(about)
        .arg(
            Arg::new("path")
                .short('e')
                .long("exe")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .help("Specify the name of the executable for which addresses should be translated. The default file is a.out."),
        )
        .arg(
            Arg::new("load_address")
                .short('l')
                .long("load-address")
                .num_args(1)
                .value_parser(ValueParser::new(parse_addr))
                .help("The address the first segment of the file is loaded at. Addresses are relative to the link address by default."),
        )
        .arg(
            Arg::new("functions")
                .short('f')
                .long("functions")
                .action(ArgAction::SetTrue)
                .help("Display function names as well as file and line number information."),
        )
        .arg(
            Arg::new("ranges")
                .short('r')
                .long("ranges")
                .action(ArgAction::SetTrue)
                .help("Display address ranges in addition to names and lines."),
        )
        .arg(
            Arg::new("basenames")
                .short('s')
                .long("basenames")
                .action(ArgAction::SetTrue)
                .help("Display only the base of each file name."),
        )
        .arg(
            Arg::new("inlinees")
                .short('i')
                .long("inlinees")
                .action(ArgAction::SetTrue)
                .help("If the address belongs to a function that was inlined, print the call sites of all enclosing inlined calls, innermost first."),
        )
        .arg(
            Arg::new("unwind")
                .short('u')
                .long("unwind")
                .action(ArgAction::SetTrue)
                .help("Print the unwind recipe for each address."),
        )
        .arg(
            Arg::new("addrs")
                .required(true)
                .num_args(1..)
                .value_parser(ValueParser::new(parse_addr))
                .help("Addresses to be translated."),
        )
        .get_matches();

    match execute(&matches) {
        Ok(()) => (),
        Err(e) => eprintln!("{:?}", e),
    };
}
