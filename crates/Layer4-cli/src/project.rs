//! Project / agent registration

use berth_foundation::{Agent, IsolationStore, Project};
use std::path::PathBuf;

pub fn add_project(
    store: &dyn IsolationStore,
    id: Option<String>,
    name: String,
    root: PathBuf,
    image: Option<String>,
) -> anyhow::Result<()> {
    let root = root.canonicalize().map_err(|e| {
        anyhow::anyhow!("project root {} is not accessible: {}", root.display(), e)
    })?;
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut project = Project::new(&id, name, root);
    if let Some(image) = image {
        project = project.with_default_image(image);
    }
    store.insert_project(&project)?;

    println!("{}", id);
    Ok(())
}

pub fn list_projects(store: &dyn IsolationStore) -> anyhow::Result<()> {
    let projects = store.list_projects()?;
    if projects.is_empty() {
        println!("No projects registered.");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<24} {}", "ID", "Name", "Image", "Root");
    for project in projects {
        println!(
            "{:<38} {:<20} {:<24} {}",
            project.id,
            project.name,
            project.default_image.as_deref().unwrap_or("-"),
            project.root_path.display()
        );
    }
    Ok(())
}

pub fn add_agent(
    store: &dyn IsolationStore,
    id: Option<String>,
    name: String,
    image: Option<String>,
) -> anyhow::Result<()> {
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut agent = Agent::new(&id, name);
    if let Some(image) = image {
        agent = agent.with_image(image);
    }
    store.insert_agent(&agent)?;

    println!("{}", id);
    Ok(())
}
