//! Message sequence sent to the completion provider.

use crate::{ChatTurn, CompletionMessage};

/// Domain-expert instruction used when no search context is available.
pub const UNGROUNDED_INSTRUCTION: &str = "你是一位永續建材檢索助理。根據使用者的描述，推薦合適的材質並簡要說明理由（強度、耐候、環保、成本等）。回答請簡潔、條列，並註明可參考的標準或認證（如 ASTM、ISO、CNS）若適用。";

/// Instruction used when search results are injected into the system message.
pub const GROUNDED_INSTRUCTION: &str = "你是一位永續建材檢索助理，會根據「搜尋到的網路資料」回答使用者。
請用以下搜尋結果作為依據，整理成簡潔、條列式的回覆，並註明可參考的標準或認證（如 ASTM、ISO、CNS）若適用。
若搜尋結果中有圖片或具體產品/規格，可在回答中提及。
回答請圖文並茂：用 Markdown 格式（**粗體**、列表、段落），並在適當處註明資料來源（例如「根據 [來源標題](連結)」）。
不要捏造搜尋結果中沒有的內容。";

pub fn grounded_system(context: &str) -> String {
    format!("{GROUNDED_INSTRUCTION}\n\n--- 搜尋結果 ---\n{context}\n---")
}

pub fn grounded_user(message: &str) -> String {
    format!("使用者問題：{message}\n\n請根據上方搜尋結果回答，並在回答中適當引用來源。")
}

/// System message, then `history` in order, then the user turn.
///
/// A non-empty `context` selects the grounded instruction and rewrites the user turn
/// to ask for a cited answer; otherwise `message` is passed through unchanged.
pub fn assemble(message: &str, history: &[ChatTurn], context: &str) -> Vec<CompletionMessage> {
    let grounded = !context.is_empty();
    let mut out = Vec::with_capacity(history.len() + 2);
    out.push(CompletionMessage::system(if grounded {
        grounded_system(context)
    } else {
        UNGROUNDED_INSTRUCTION.to_string()
    }));
    out.extend(history.iter().map(CompletionMessage::from));
    out.push(CompletionMessage::user(if grounded {
        grounded_user(message)
    } else {
        message.to_string()
    }));
    out
}
