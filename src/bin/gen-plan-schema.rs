use kanari::model::RolloutPlan;

fn main() -> anyhow::Result<()> {
    // Use: cargo run --bin gen-plan-schema > rollout-plan.schema.json
    // for editor validation of plan files
    let schema = schemars::schema_for!(RolloutPlan);

    let json_output = serde_json::to_string_pretty(&schema)?;
    println!("{}", json_output);
    Ok(())
}
