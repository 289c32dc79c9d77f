use args::Args;
use getopts::Occur;
use glob::glob;
use leak_report::Summary;
use std::fs;

const PROGRAM_DESC: &str = "Summarize leak_report leak reports";
const PROGRAM_NAME: &str = "lr_print";

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "r",
        "report",
        "Report file, or a glob pattern matching several",
        "PATH",
        Occur::Req,
        None,
    );
    args.option(
        "t",
        "threshold",
        "Fold stacks holding less than this percentage of leaked bytes",
        "PERCENT",
        Occur::Optional,
        Some("0".to_string()),
    );
    args.flag("y", "yaml", "Print the summary as YAML");

    args.parse_from_cli()?;

    let pattern: String = args.value_of("report")?;
    let threshold: f64 = args.value_of("threshold")?;
    let yaml: bool = args.value_of("yaml")?;

    let mut summaries = vec![];

    for path in glob(pattern.as_str())? {
        let path = path?;
        eprintln!("found report in {}", path.display());
        let text = fs::read_to_string(path)?;
        summaries.push(Summary::parse(&text));
    }

    // Aggregate all reports.
    let mut aggregate = Summary::new();

    for summary in summaries.iter() {
        aggregate.merge(summary);
    }

    if yaml {
        print!("{}", serde_yaml::to_string(&aggregate)?);
    } else {
        let mut out = String::new();
        aggregate.fmt_with_threshold(threshold, &mut out)?;
        println!("{}", out);
    }

    Ok(())
}
