//! Outbound e-mail templates.

use super::state::AuthConfig;
use crate::api::email::EmailMessage;

pub(super) fn confirmation_email(config: &AuthConfig, to_email: &str, url: &str) -> EmailMessage {
    let subject = format!(
        "[{}] {} 회원 가입을 위해 E-mail 주소를 확인해주세요!",
        config.site_domain(),
        config.site_name()
    );
    let body = format!(
        "안녕하세요. {domain}의 {name}입니다.\n\
         \n\
         {to_email} 주소로 {name} 회원 가입 요청이 들어왔습니다.\n\
         본인이 요청하신 것이 맞다면 아래 주소로 접속하여 E-mail 주소를 확인해주세요.\n\
         \n\
         {url}\n\
         \n\
         본인이 요청하지 않았다면 이 메일을 무시하셔도 됩니다.\n",
        domain = config.site_domain(),
        name = config.site_name(),
    );
    EmailMessage {
        from_email: config.email_from().to_string(),
        to_email: to_email.to_string(),
        subject,
        body,
    }
}

pub(super) fn password_reset_email(config: &AuthConfig, to_email: &str, url: &str) -> EmailMessage {
    let subject = format!("{}({}) 비밀번호 리셋 요청", config.site_name(), config.site_domain());
    let body = format!(
        "안녕하세요. {domain}의 {name}입니다.\n\
         \n\
         {to_email} 계정의 비밀번호 리셋 요청이 들어왔습니다.\n\
         아래 주소로 접속하여 새 비밀번호를 설정해주세요.\n\
         \n\
         {url}\n\
         \n\
         본인이 요청하지 않았다면 이 메일을 무시하셔도 됩니다.\n",
        domain = config.site_domain(),
        name = config.site_name(),
    );
    EmailMessage {
        from_email: config.email_from().to_string(),
        to_email: to_email.to_string(),
        subject,
        body,
    }
}
