use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub store_name: &'a str,
    pub bot_name: &'a str,
    pub bot_persona: &'a str,
    pub customer_name: Option<&'a str>,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            store_name => display_or(ctx.store_name, "our store"),
            bot_name => display_or(ctx.bot_name, "Support Bot"),
            bot_persona => ctx.bot_persona.trim(),
            customer_name => ctx.customer_name.map(str::trim).unwrap_or(""),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value.trim()
    }
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are {}, the shopping assistant for {}.\n\
         Be accurate, concise and friendly. Never invent prices or stock levels.\n\
         If the customer asks for a human, a staff member or a representative, set handover=true.\n\
         Reply with JSON: {{\"reply\": string, \"handover\": bool}}.\n",
        display_or(ctx.bot_name, "Support Bot"),
        display_or(ctx.store_name, "our store"),
    );

    if !ctx.bot_persona.trim().is_empty() {
        prompt.push_str("\nPersona:\n");
        prompt.push_str(ctx.bot_persona.trim());
        prompt.push('\n');
    }

    if let Some(name) = ctx.customer_name.map(str::trim).filter(|n| !n.is_empty()) {
        prompt.push_str(&format!("\nThe customer's name is {name}.\n"));
    }

    prompt
}
