use crate::output::{emit_json, exec_entries, execs_table};
use recovery_core::exec::ExecRegistry;

pub fn run(json: bool) -> anyhow::Result<()> {
    let registry = ExecRegistry::with_defaults();
    let entries = exec_entries(&registry);
    if json {
        emit_json(&entries)
    } else {
        print!("{}", execs_table(&entries));
        Ok(())
    }
}
