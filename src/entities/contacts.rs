use crate::mapping::{field, FieldKind::*, FieldSpec};

pub const CONTACT_FIELDS: &[FieldSpec] = &[
    field("id", "id", Identifier),
    field("First_Name", "first_name", Text),
    field("Last_Name", "last_name", Text),
    field("Full_Name", "full_name", Text),
    field("Salutation", "salutation", Text),
    field("Email", "email", Text),
    field("Secondary_Email", "secondary_email", Text),
    field("Phone", "phone", Text),
    field("Mobile", "mobile", Text),
    field("Account_Name", "account_id", LookupId),
    field("Account_Name", "account_name", LookupName),
    field("Owner", "owner_id", LookupId),
    field("Owner", "owner_name", LookupName),
    field("Owner", "owner_email", LookupEmail),
    field("Title", "title", Text),
    field("Department", "department", Text),
    field("Lead_Source", "lead_source", Text),
    field("Mailing_City", "mailing_city", Text),
    field("Mailing_Country", "mailing_country", Text),
    field("Date_of_Birth", "date_of_birth", DateTime),
    field("Role_Success_Stage", "role_success_stage", Text),
    field("University", "university", Text),
    field("Degree", "degree", Text),
    field("Graduation_Year", "graduation_year", Integer),
    field("Requires_a_visa", "requires_a_visa", Boolean),
    field("Paid_Role", "paid_role", Boolean),
    field("Email_Opt_Out", "email_opt_out", Boolean),
    field("Do_Not_Contact", "do_not_contact", Boolean),
    field("Skills", "skills", JsonList),
    field("Industry_Preferences", "industry_preferences", JsonList),
    field("Tag", "tag", JsonList),
    field("$approval", "approval", Json),
    field("Description", "description", Text),
    field("Created_By", "created_by_id", LookupId),
    field("Created_Time", "created_time", DateTime),
    field("Last_Activity_Time", "last_activity_time", DateTime),
    field("Modified_Time", "modified_time", DateTime),
];
