use std::env;
use std::path::Path;

use instmux::CommandTable;

// Usage: dump_table [coherent_sdg | dg645 | path/to/table.toml]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let arg = env::args().nth(1).unwrap_or_else(|| "coherent_sdg".into());
    let table = if Path::new(&arg).is_file() {
        CommandTable::from_path(Path::new(&arg))?
    } else {
        CommandTable::builtin(&arg)?.as_ref().clone()
    };

    let inst = table.instrument();
    println!(
        "{} (identify {:?}, acknowledge {:?}), {} commands, {} status codes",
        inst.name,
        inst.identify,
        inst.acknowledge,
        table.len(),
        table.statuses().len()
    );
    for c in table.iter() {
        println!(
            "{:>4}  {:<32} read {:<14} {:<13} write {:<22} {}",
            c.channel_id,
            c.description,
            c.read_request.as_deref().unwrap_or("-"),
            c.read_kind.as_str(),
            c.write_template.as_ref().map_or("-", |t| t.as_str()),
            c.write_kind.as_str()
        );
    }
    Ok(())
}
