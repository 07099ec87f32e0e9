// ABOUTME: emits json schemas for the execute request and response wire types to stdout.
// ABOUTME: intended for api-tier implementers and external validators.

fn main() -> Result<(), serde_json::Error> {
    let schemas = serde_json::json!({
        "request": schemars::schema_for!(savalet_common::ExecuteRequest),
        "response": schemars::schema_for!(savalet_common::ExecuteResponse),
    });
    println!("{}", serde_json::to_string_pretty(&schemas)?);
    Ok(())
}
