use serde_json::Value;

// Serializes the $elements autocapture payload into the "elements chain"
// string stored on the event row. Each element renders as
//   tag.class1.class2:key="value"key2="value2"
// and elements are joined with ";". Values are quoted with inner quotes
// escaped, so the chain can be split back apart downstream.

pub fn elements_to_chain(elements: &[Value]) -> Option<String> {
    let rendered: Option<Vec<String>> = elements.iter().map(element_to_string).collect();
    Some(rendered?.join(";"))
}

fn element_to_string(element: &Value) -> Option<String> {
    let element = element.as_object()?;

    let tag_name = element
        .get("tag_name")
        .and_then(Value::as_str)
        .unwrap_or("div");

    let mut out = String::from(tag_name);
    for class in extract_classes(element) {
        out.push('.');
        out.push_str(&class);
    }
    out.push(':');

    let mut push_attr = |key: &str, value: &str| {
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&value.replace('"', "\\\""));
        out.push('"');
    };

    if let Some(text) = element
        .get("$el_text")
        .or_else(|| element.get("text"))
        .and_then(Value::as_str)
    {
        push_attr("text", text);
    }
    if let Some(href) = element.get("href").and_then(Value::as_str) {
        push_attr("href", href);
    }
    if let Some(attr_id) = element.get("attr_id").and_then(Value::as_str) {
        push_attr("attr_id", attr_id);
    }
    if let Some(nth_child) = element.get("nth_child").and_then(Value::as_i64) {
        push_attr("nth-child", &nth_child.to_string());
    }
    if let Some(nth_of_type) = element.get("nth_of_type").and_then(Value::as_i64) {
        push_attr("nth-of-type", &nth_of_type.to_string());
    }

    // The autocapture payload carries the remaining attributes as
    // attr__-prefixed keys inside "attributes"
    if let Some(Value::Object(attributes)) = element.get("attributes") {
        let mut keys: Vec<_> = attributes.keys().collect();
        keys.sort();
        for key in keys {
            if let Some(value) = attributes.get(key).and_then(Value::as_str) {
                if key.starts_with("attr__") {
                    push_attr(key, value);
                }
            }
        }
    }

    Some(out)
}

// Classes arrive either as an attr_class array, or packed into the
// attributes map as attr__class
fn extract_classes(element: &serde_json::Map<String, Value>) -> Vec<String> {
    if let Some(Value::Array(classes)) = element.get("attr_class") {
        return classes
            .iter()
            .filter_map(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(sanitize_class)
            .collect();
    }

    if let Some(Value::Object(attributes)) = element.get("attributes") {
        if let Some(class) = attributes.get("attr__class").and_then(Value::as_str) {
            return class
                .split_whitespace()
                .map(sanitize_class)
                .collect();
        }
    }

    Vec::new()
}

// Quotes and backslashes in class names would corrupt the chain format
fn sanitize_class(class: &str) -> String {
    class.replace(['"', '\\'], "")
}
