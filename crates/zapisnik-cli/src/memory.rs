//! Store administration from the command line

use zapisnik_store::{ForgetTarget, RecordStore, UserId};

pub fn list(store: &dyn RecordStore, user: UserId) -> anyhow::Result<()> {
    let fields = store.list_fields(user)?;
    let entries = store.list_memory(user)?;

    if fields.is_empty() && entries.is_empty() {
        println!("No records for user {user}");
        return Ok(());
    }

    if !fields.is_empty() {
        println!("Fields:");
        for (name, value) in fields {
            println!("  {name}: {value}");
        }
    }
    if !entries.is_empty() {
        println!("Entries:");
        for entry in entries {
            println!("  {}: {}", entry.id, entry.text);
        }
    }
    Ok(())
}

pub fn forget(
    store: &dyn RecordStore,
    user: UserId,
    entry: Option<i64>,
    all: bool,
) -> anyhow::Result<()> {
    if all {
        store.delete_user(user)?;
        println!("Deleted every record for user {user}");
        return Ok(());
    }

    match entry {
        Some(id) => {
            let removed = store.delete_memory(user, ForgetTarget::Entry(id))?;
            if removed > 0 {
                println!("Deleted entry {id}");
            } else {
                println!("No entry {id} for user {user}");
            }
        }
        None => anyhow::bail!("pass --entry <id> or --all"),
    }
    Ok(())
}
