//! Newsletter signup.

use tracing::info;

use super::flash::{Flash, FlashKind};
use super::views::page;
use crate::{Request, Response};

pub async fn form(req: Request) -> Response {
    let content = "<h2>Sign up for our newsletter to receive news and specials!</h2>\n\
        <form method=\"post\" action=\"/newsletter\">\n\
        <label for=\"name\">Name</label> <input type=\"text\" id=\"name\" name=\"name\">\n\
        <label for=\"email\">Email</label> <input type=\"email\" id=\"email\" name=\"email\" required>\n\
        <button type=\"submit\">Register</button>\n\
        </form>";
    Response::html(page("Newsletter", Flash::of(&req), content))
}

/// Takes a form post, and redirects with a flash either way.
pub async fn subscribe(req: Request) -> Response {
    let form = req.form();
    let name = form.get("name").map(|s| s.trim()).unwrap_or_default();
    let email = form.get("email").map(|s| s.trim()).unwrap_or_default();

    if !is_valid_email(email) {
        let flash = Flash::new(
            FlashKind::Danger,
            "Validation error!",
            "The email address you entered was not valid.",
        );
        return flash.set_on(Response::redirect("/newsletter"));
    }

    info!(name, email, "newsletter signup");
    let flash = Flash::new(
        FlashKind::Success,
        "Thank you!",
        "You have now been signed up for the newsletter.",
    );
    flash.set_on(Response::redirect("/thank-you"))
}

pub async fn thank_you(req: Request) -> Response {
    let content = "<h1>Thank you!</h1>\n<p>We will be in touch.</p>\n<p><a href=\"/\">Back to the home page</a></p>";
    Response::html(page("Thank you", Flash::of(&req), content))
}

/// `local@domain.tld`: one `@`, no whitespace, a dotted domain with no empty
/// labels.
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else { return false };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}
