use serde::Serialize;

/// Chat speaker role as the wire expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One prior conversation message sent with the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One user-supplied file reference attached to a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// JSON body of the streaming chat POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileRef>>,
    pub search_grounding: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            thread_id: None,
            files: None,
            search_grounding: false,
        }
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_search_grounding(mut self, search_grounding: bool) -> Self {
        self.search_grounding = search_grounding;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_wire_shape_with_camel_case_keys() {
        let request = ChatRequest::new(
            vec![ChatMessage::new(ChatRole::User, "hello")],
            "gpt-4o-mini",
        )
        .with_thread_id("t-1")
        .with_files(vec![FileRef {
            id: "file-1".to_string(),
            name: "notes.pdf".to_string(),
            kind: "application/pdf".to_string(),
            size: 2_048,
            url: None,
        }])
        .with_search_grounding(true);

        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            json!({
                "messages": [{"role": "user", "content": "hello"}],
                "model": "gpt-4o-mini",
                "threadId": "t-1",
                "files": [{"id": "file-1", "name": "notes.pdf", "type": "application/pdf", "size": 2048}],
                "searchGrounding": true,
            })
        );
    }

    #[test]
    fn omits_optional_fields_when_unset() {
        let request = ChatRequest::new(vec![], "gpt-4o-mini");
        let value = serde_json::to_value(&request).expect("serialize");

        assert!(value.get("threadId").is_none());
        assert!(value.get("files").is_none());
        assert_eq!(value["searchGrounding"], json!(false));
    }
}
