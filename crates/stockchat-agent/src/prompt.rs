/// Schema description handed to the SQL agent. Kept as prose rather than a
/// live introspection so the prompt stays stable across deployments.
pub const TABLE_INFO: &str = "\
Table items: id INTEGER PRIMARY KEY, name TEXT, category TEXT, quantity INTEGER, unit_price REAL, warehouse_id INTEGER.
Table warehouses: id INTEGER PRIMARY KEY, name TEXT, city TEXT.
Table stock_movements: id INTEGER PRIMARY KEY, item_id INTEGER, delta INTEGER, moved_at TEXT.
items.warehouse_id references warehouses.id; stock_movements.item_id references items.id.";

pub const SQL_SYSTEM_PROMPT: &str = "\
You translate stock-management questions into SQLite SELECT statements.
Schema:
{table_info}
Answer with SQL only. Never modify data. Prefer a single statement; end each statement with a semicolon.";

pub const NLP_SYSTEM_PROMPT: &str = "\
You are the assistant of a stock-management system. A database query was run
on the user's behalf and you explain the outcome in plain language.
Query: {query}
Data: {data}
At most {result_limit} rows were fetched per query; mention the cut-off only
if the data looks truncated. If the data is an error message, apologize and
describe the problem without technical jargon.";

/// Substitute `{name}` placeholders. Unknown placeholders are left in
/// place so a template typo shows up in the model input instead of
/// disappearing.
pub fn render(template: &str, variables: &[(&str, String)]) -> String {
    let mut rendered = template.to_string();
    for (name, value) in variables {
        rendered = rendered.replace(&format!("{{{name}}}"), value);
    }
    rendered
}

pub fn sql_system_prompt() -> String {
    render(SQL_SYSTEM_PROMPT, &[("table_info", TABLE_INFO.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_every_placeholder() {
        let rendered = render(
            "q={query} d={data} n={result_limit}",
            &[
                ("query", "SELECT 1".to_string()),
                ("data", "rows".to_string()),
                ("result_limit", "50".to_string()),
            ],
        );
        assert_eq!(rendered, "q=SELECT 1 d=rows n=50");
    }

    #[test]
    fn sql_prompt_embeds_the_schema() {
        let prompt = sql_system_prompt();
        assert!(prompt.contains("Table items"));
        assert!(!prompt.contains("{table_info}"));
    }

    #[test]
    fn unknown_placeholders_survive_rendering() {
        let rendered = render("{known} {unknown}", &[("known", "yes".to_string())]);
        assert_eq!(rendered, "yes {unknown}");
    }
}
