use axum::response::Html;

const UPLOAD_FORM: &str = include_str!("../../static/index.html");

pub async fn upload_form() -> Html<&'static str> {
    Html(UPLOAD_FORM)
}
