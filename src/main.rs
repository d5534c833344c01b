use std::process;
use transact_tester::{Pick, TestRun};

const PROGNAME: &str = "transact-tester";

/// Parsed command line
#[derive(Debug, PartialEq, Eq)]
struct Args {
    seed: Option<u32>,
    target: String,
    op_count: u32,
    kinds: String,
    address: Pick<u64>,
    count: Pick<u32>,
}

/// Parse an unsigned number the way C's `strtoull(s, _, 0)` does
///
/// `0x`/`0X` selects hex, a leading `0` selects octal, anything else is
/// decimal. The whole string must be consumed.
fn parse_number(s: &str) -> Option<u64> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() || digits.starts_with('+') {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn parse_u32(name: &str, s: &str) -> Result<u32, String> {
    let value = parse_number(s).ok_or_else(|| format!("invalid {}: {}", name, s))?;
    u32::try_from(value).map_err(|_| format!("{} out of range: {}", name, s))
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut rest = args;
    let mut seed = None;
    if rest.len() >= 2 && rest[0] == "-s" {
        seed = Some(parse_u32("seed", &rest[1])?);
        rest = &rest[2..];
    }

    if rest.len() < 2 || rest.len() > 5 {
        return Err("wrong number of arguments".to_string());
    }

    let target = rest[0].clone();
    let op_count = parse_u32("operation count", &rest[1])?;
    let kinds = rest.get(2).cloned().unwrap_or_default();
    let address = match rest.get(3).map(String::as_str) {
        None => Pick::Fixed(0),
        Some("*") => Pick::Random,
        Some(s) => Pick::Fixed(parse_number(s).ok_or_else(|| format!("invalid address: {}", s))?),
    };
    let count = match rest.get(4).map(String::as_str) {
        None => Pick::Fixed(0),
        Some("*") => Pick::Random,
        Some(s) => Pick::Fixed(parse_u32("count", s)?),
    };

    Ok(Args {
        seed,
        target,
        op_count,
        kinds,
        address,
        count,
    })
}

fn usage() {
    eprintln!(
        "usage: {prog} [-s Seed] pipe:/path/to/unit.sock OpCount [RWFU] [Address|*] [Count|*]\n\
         usage: {prog} [-s Seed] raw:/dev/sdX OpCount [RWFU] [Address|*] [Count|*]\n\
         \x20   -s Seed     Seed to use for randomness (default: random)\n\
         \x20   pipe:PATH   Storage unit socket (a bare socket path also works)\n\
         \x20   raw:PATH    SCSI block device (needs read/write access)\n\
         \x20   OpCount     Operation count\n\
         \x20   RWFU        One or more: R: Read, W: Write, F: Flush, U: Unmap\n\
         \x20   Address     Starting block address, *: random\n\
         \x20   Count       Block count per operation, *: random",
        prog = PROGNAME
    );
}

fn main() {
    env_logger::init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}: {}", PROGNAME, msg);
            usage();
            process::exit(libc::EINVAL);
        }
    };

    let seed = args.seed.unwrap_or_else(rand::random::<u32>);
    println!(
        "{} -s {} {} {} \"{}\" {} {}",
        PROGNAME, seed, args.target, args.op_count, args.kinds, args.address, args.count
    );

    let result = TestRun::builder()
        .target(&args.target)
        .op_count(args.op_count)
        .kinds(&args.kinds)
        .address(args.address)
        .count(args.count)
        .seed(seed)
        .build()
        .and_then(|run| run.run());

    match result {
        Ok(summary) => println!("{}", summary),
        Err(err) => {
            eprintln!("{}: {}", PROGNAME, err);
            process::exit(err.code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_number_prefixes() {
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x1F"), Some(31));
        assert_eq!(parse_number("0X10"), Some(16));
        assert_eq!(parse_number("017"), Some(15));
        assert_eq!(parse_number("09"), None);
        assert_eq!(parse_number("0x"), None);
        assert_eq!(parse_number("12abc"), None);
        assert_eq!(parse_number("-1"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_minimal_command_line() {
        let parsed = parse_args(&args(&["pipe:/tmp/u.sock", "100"])).unwrap();
        assert_eq!(
            parsed,
            Args {
                seed: None,
                target: "pipe:/tmp/u.sock".to_string(),
                op_count: 100,
                kinds: String::new(),
                address: Pick::Fixed(0),
                count: Pick::Fixed(0),
            }
        );
    }

    #[test]
    fn test_full_command_line() {
        let parsed = parse_args(&args(&["-s", "0x10", "raw:/dev/sdz", "1000", "wru", "*", "8"])).unwrap();
        assert_eq!(parsed.seed, Some(16));
        assert_eq!(parsed.kinds, "wru");
        assert_eq!(parsed.address, Pick::Random);
        assert_eq!(parsed.count, Pick::Fixed(8));

        let parsed = parse_args(&args(&["unit.sock", "5", "WR", "0x100000000", "*"])).unwrap();
        assert_eq!(parsed.seed, None);
        assert_eq!(parsed.address, Pick::Fixed(0x1_0000_0000));
        assert_eq!(parsed.count, Pick::Random);
    }

    #[test]
    fn test_usage_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["-s", "1", "only-target"])).is_err());
        assert!(parse_args(&args(&["t", "1", "W", "0", "1", "extra"])).is_err());
        assert!(parse_args(&args(&["t", "many"])).is_err());
        assert!(parse_args(&args(&["t", "1", "W", "0", "0x100000000"])).is_err());
    }
}
